pub mod api;
pub mod error;
pub mod ids;
pub mod job;
pub mod outcome;
pub mod time;
pub mod tuple;

pub use api::*;
pub use error::{FerryError, FerryResult};
pub use ids::*;
pub use job::*;
pub use outcome::*;
pub use time::*;
pub use tuple::*;
