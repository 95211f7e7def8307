//! `Tokenizer`: the tokenizer collaborator boundary (spec §1, §6). String
//! encoding/decoding and chat-template formatting are out of scope here.

/// Special token ids the generator consults for stop detection and
/// embedding lookups (spec §6).
#[derive(Clone, Copy, Debug, Default)]
pub struct SpecialTokens {
    pub bos: Option<u32>,
    pub eos: Option<u32>,
    pub pad: Option<u32>,
}

pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Vec<u32>;
    fn decode(&self, tokens: &[u32], skip_special: bool, clean: bool) -> String;
    fn special_tokens(&self) -> SpecialTokens;
    fn vocab_size(&self) -> u32;
}
