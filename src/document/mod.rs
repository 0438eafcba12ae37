pub mod bson;
pub mod document;
