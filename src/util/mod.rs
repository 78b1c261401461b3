pub mod parallel;
pub mod pool;
pub mod vec2;
