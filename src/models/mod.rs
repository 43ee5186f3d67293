pub mod record;
pub mod request;

pub use record::*;
pub use request::*;
