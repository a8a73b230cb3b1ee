// Each integration test binary uses a different subset of the helpers
#![allow(dead_code, unused_imports)]

pub mod builders;
pub mod db;
pub mod keys;

pub use builders::DeviceBuilder;
pub use db::TestDb;
pub use keys::test_jwks;
