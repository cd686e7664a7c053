pub mod admin;
pub mod files;
pub mod stream;
pub mod thumbs;
