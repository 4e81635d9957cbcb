//! 가격 도메인 모델.

pub mod fallback;
pub mod price;
pub mod result;

pub use fallback::*;
pub use price::*;
pub use result::*;
