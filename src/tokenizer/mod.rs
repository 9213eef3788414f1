mod token_count;
#[allow(clippy::module_inception)]
mod tokenizer;

pub use token_count::{ApproxTokenCounter, CachedTokenCounter, TokenCounter};
pub use tokenizer::{Tokenizer, TOKENIZER_VERSION};
