pub mod middleware;
pub mod test_utils;
