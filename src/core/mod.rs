pub mod decoder;
pub mod output;
pub mod source;
pub mod stream;
