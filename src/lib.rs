pub mod document;
pub mod network;
pub mod router;
pub mod util;
pub mod test_util;
