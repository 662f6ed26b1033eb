pub mod jiter;
pub mod jphys;
pub mod record;

pub use jiter::Jiter;
pub use jphys::Jphys;
pub use record::Record;
