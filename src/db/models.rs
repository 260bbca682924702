mod rotation;
mod secret;

pub use rotation::*;
pub use secret::*;
