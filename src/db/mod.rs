pub mod connection;
pub mod enrollments;
pub mod schema;
pub mod queries;

pub use connection::*;
pub use enrollments::*;
pub use schema::*;
pub use queries::*;
