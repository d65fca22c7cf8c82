//! Hugging Face compatible export of the subword model built on top of `tokenizers`.

use std::fs;
use std::path::Path;

use ahash::AHashMap;
use serde_json::Value;
use tokenizers::decoders::{bpe::BPEDecoder, DecoderWrapper};
use tokenizers::models::bpe::BPE;
use tokenizers::pre_tokenizers::{whitespace::WhitespaceSplit, PreTokenizerWrapper};
use tokenizers::tokenizer::AddedToken;
use tokenizers::Tokenizer;

use crate::error::{NmtError, Result};
use crate::special_tokens::{self, UNK_WORD};
use crate::subword::{SubwordModel, END_OF_WORD};

/// Builds a Hugging Face tokenizer reproducing the merge table of `model`.
///
/// Reserved tokens take ids `[0, 4)`, followed by the alphabet and then one id per merge
/// result in learning order.
pub fn as_tokenizer(model: &SubwordModel) -> Result<Tokenizer> {
    let mut vocab: AHashMap<String, u32> = AHashMap::new();
    let mut next_id = 0u32;
    let mut insert = |token: String, vocab: &mut AHashMap<String, u32>| {
        if !vocab.contains_key(&token) {
            vocab.insert(token, next_id);
            next_id += 1;
        }
    };
    for token in special_tokens::reserved_tokens() {
        insert((*token).to_string(), &mut vocab);
    }
    for symbol in model.alphabet() {
        insert(symbol.clone(), &mut vocab);
    }
    for (left, right) in model.merges() {
        insert(format!("{left}{right}"), &mut vocab);
    }

    let bpe = BPE::builder()
        .vocab_and_merges(vocab, model.merges().to_vec())
        .unk_token(UNK_WORD.to_string())
        .end_of_word_suffix(END_OF_WORD.to_string())
        .build()
        .map_err(|err| NmtError::Tokenizers(err.to_string()))?;

    let mut tokenizer = Tokenizer::new(bpe);
    tokenizer.with_pre_tokenizer(Some(PreTokenizerWrapper::WhitespaceSplit(WhitespaceSplit)));
    tokenizer.with_decoder(Some(DecoderWrapper::BPE(BPEDecoder::new(
        END_OF_WORD.to_string(),
    ))));
    let added = special_tokens::reserved_tokens()
        .iter()
        .map(|token| AddedToken::from((*token).to_string(), true))
        .collect::<Vec<_>>();
    tokenizer.add_special_tokens(&added);
    Ok(tokenizer)
}

/// Serialises the model to a `tokenizer.json` string.
pub fn tokenizer_json(model: &SubwordModel, pretty: bool) -> Result<String> {
    let tokenizer = as_tokenizer(model)?;
    let raw = tokenizer
        .to_string(false)
        .map_err(|err| NmtError::Tokenizers(err.to_string()))?;
    let value: Value = serde_json::from_str(&raw)?;
    if pretty {
        Ok(serde_json::to_string_pretty(&value)?)
    } else {
        Ok(serde_json::to_string(&value)?)
    }
}

/// Writes the model as `tokenizer.json` for Hugging Face tooling.
pub fn save_huggingface_tokenizer<P: AsRef<Path>>(
    model: &SubwordModel,
    path: P,
    pretty: bool,
) -> Result<()> {
    let json = tokenizer_json(model, pretty)?;
    fs::write(path.as_ref(), json).map_err(|err| NmtError::io_at(err, path.as_ref()))
}

/// Loads a tokenizer.json file via the Hugging Face `tokenizers` crate.
pub fn load_tokenizer<P: AsRef<Path>>(path: P) -> Result<Tokenizer> {
    Tokenizer::from_file(path).map_err(|err| NmtError::Tokenizers(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SubwordConfig;
    use crate::subword::SubwordLearner;
    use tempfile::tempdir;

    fn model() -> SubwordModel {
        let cfg = SubwordConfig::builder()
            .symbols(10)
            .min_frequency(1)
            .show_progress(false)
            .build()
            .expect("config");
        let mut learner = SubwordLearner::new(cfg).expect("learner");
        learner.add_pair("low lower lowest", "basso piu basso");
        learner.finish().expect("learn")
    }

    #[test]
    fn exported_json_describes_a_bpe_model() {
        let json = tokenizer_json(&model(), true).expect("json");
        let value: Value = serde_json::from_str(&json).expect("parse");
        assert_eq!(value["model"]["type"], "BPE");
        assert_eq!(value["model"]["end_of_word_suffix"], END_OF_WORD);
        assert_eq!(value["model"]["vocab"][UNK_WORD], 1);
    }

    #[test]
    fn saved_tokenizer_can_be_reloaded() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("tokenizer.json");
        let model = model();
        save_huggingface_tokenizer(&model, &path, false).expect("save");
        let tokenizer = load_tokenizer(&path).expect("load");
        assert!(tokenizer.get_vocab_size(false) >= model.alphabet().len() + 4);
    }
}
