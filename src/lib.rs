pub mod messaging;
pub mod test_util;
