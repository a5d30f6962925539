mod sessions;

pub use sessions::*;
