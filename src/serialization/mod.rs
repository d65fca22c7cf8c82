//! Helpers for exporting the subword model in Hugging Face formats.

pub mod huggingface;

pub use huggingface::{as_tokenizer, load_tokenizer, save_huggingface_tokenizer, tokenizer_json};
