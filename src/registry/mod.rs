mod named_map;
pub use named_map::*;

#[cfg(test)]
mod named_map_test;
