pub mod storage;

pub use storage::{AuthCredential, AuthStorage};
