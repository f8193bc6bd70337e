pub mod solver;
pub use solver::{Error, Lsoda, Method, Options, Stats, System};
