pub mod device;

pub use device::Entity as Device;
