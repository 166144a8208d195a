pub mod faer_ndarray;
pub mod sparse;
pub(crate) mod utils;
