pub mod rotation;
pub mod secrets;
pub mod workspace_keys;
