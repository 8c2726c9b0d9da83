pub mod dice;
pub mod images;
pub mod progress;
