pub mod codec;
pub mod geo;
pub mod marshal;
pub mod schema;
pub mod value;

pub use geo::GeoPoint;
pub use schema::{FieldType, Schema};
pub use value::{Point, Row, SqlValue};
