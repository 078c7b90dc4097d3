//! Safetensors checkpoints bundling weights, config and vocabulary.
//!
//! The `__metadata__` header carries the format tag, the [`ModelConfig`] as
//! JSON and the vocabulary symbols in id order. Every tensor is little-endian
//! F32 and must match the shape the config implies exactly.

use crate::config::ModelConfig;
use crate::error::{ModelError, Result};
use crate::generate::Generator;
use crate::model::LanguageModel;
use crate::vocab::Vocabulary;
use crate::weights::{ParamSource, ParamVisitor};
use ndarray::{Array1, Array2};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use tracing::info;

pub const FORMAT_TAG: &str = "charformer/1";

const FORMAT_KEY: &str = "format";
const CONFIG_KEY: &str = "config";
const VOCAB_KEY: &str = "vocab";

pub struct Checkpoint {
    pub vocab: Vocabulary,
    pub model: LanguageModel,
}

impl Checkpoint {
    pub fn new(model: LanguageModel, vocab: Vocabulary) -> Result<Self> {
        if vocab.size() != model.vocab_size() {
            return Err(ModelError::ConfigMismatch(format!(
                "vocabulary has {} symbols, config declares {}",
                vocab.size(),
                model.vocab_size()
            )));
        }
        Ok(Self { vocab, model })
    }

    pub fn config(&self) -> &ModelConfig {
        self.model.config()
    }

    pub fn generator(&self) -> Result<Generator<'_>> {
        Generator::new(&self.model, &self.vocab)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path).map_err(|e| {
            ModelError::Checkpoint(format!("failed to read {}: {}", path.display(), e))
        })?;
        let checkpoint = Self::from_bytes(&data)?;
        let config = checkpoint.config();
        info!(
            path = %path.display(),
            vocab = config.vocab_size,
            layers = config.n_layer,
            n_embd = config.n_embd,
            params = config.parameter_count(),
            "loaded checkpoint"
        );
        Ok(checkpoint)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let (_, header) = SafeTensors::read_metadata(data)?;
        let metadata = header
            .metadata()
            .as_ref()
            .ok_or_else(|| ModelError::Checkpoint("missing __metadata__ header".into()))?;

        let format = metadata_field(metadata, FORMAT_KEY)?;
        if format != FORMAT_TAG {
            return Err(ModelError::Checkpoint(format!(
                "unsupported format {:?}, expected {:?}",
                format, FORMAT_TAG
            )));
        }

        let config: ModelConfig = serde_json::from_str(metadata_field(metadata, CONFIG_KEY)?)?;
        config.validate()?;
        let symbols: Vec<char> = serde_json::from_str(metadata_field(metadata, VOCAB_KEY)?)?;
        let vocab = Vocabulary::new(symbols)?;
        if vocab.size() != config.vocab_size {
            return Err(ModelError::ConfigMismatch(format!(
                "vocabulary has {} symbols, config declares {}",
                vocab.size(),
                config.vocab_size
            )));
        }

        let tensors = SafeTensors::deserialize(data)?;
        let mut source = TensorSource {
            tensors: &tensors,
            used: HashSet::new(),
        };
        let model = LanguageModel::load(config, &mut source)?;
        source.reject_unused()?;

        Self::new(model, vocab)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let bytes = self.to_bytes()?;
        fs::write(path, &bytes).map_err(|e| {
            ModelError::Checkpoint(format!("failed to write {}: {}", path.display(), e))
        })?;
        info!(path = %path.display(), bytes = bytes.len(), "saved checkpoint");
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        encode(self.config(), &self.vocab, &self.model)
    }
}

fn metadata_field<'a>(metadata: &'a HashMap<String, String>, key: &str) -> Result<&'a str> {
    metadata
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| ModelError::Checkpoint(format!("metadata field `{}` missing", key)))
}

fn encode(config: &ModelConfig, vocab: &Vocabulary, model: &LanguageModel) -> Result<Vec<u8>> {
    let mut collector = TensorCollector::default();
    model.visit(&mut collector);

    let mut metadata = HashMap::new();
    metadata.insert(FORMAT_KEY.to_string(), FORMAT_TAG.to_string());
    metadata.insert(CONFIG_KEY.to_string(), serde_json::to_string(config)?);
    metadata.insert(VOCAB_KEY.to_string(), serde_json::to_string(vocab.symbols())?);

    let views = collector
        .tensors
        .iter()
        .map(|(name, shape, bytes)| {
            let view = TensorView::new(Dtype::F32, shape.clone(), bytes)?;
            Ok((name.clone(), view))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(safetensors::serialize(views, &Some(metadata))?)
}

#[derive(Default)]
struct TensorCollector {
    tensors: Vec<(String, Vec<usize>, Vec<u8>)>,
}

impl TensorCollector {
    fn push<'a>(&mut self, name: &str, shape: Vec<usize>, values: impl Iterator<Item = &'a f32>) {
        let bytes = values.flat_map(|v| v.to_le_bytes()).collect();
        self.tensors.push((name.to_string(), shape, bytes));
    }
}

impl ParamVisitor for TensorCollector {
    fn matrix(&mut self, name: &str, value: &Array2<f32>) {
        self.push(name, value.shape().to_vec(), value.iter());
    }

    fn vector(&mut self, name: &str, value: &Array1<f32>) {
        self.push(name, vec![value.len()], value.iter());
    }
}

struct TensorSource<'a, 'data> {
    tensors: &'a SafeTensors<'data>,
    used: HashSet<String>,
}

impl TensorSource<'_, '_> {
    fn fetch(&mut self, name: &str, expected: &[usize]) -> Result<Vec<f32>> {
        let view = self
            .tensors
            .tensor(name)
            .map_err(|_| ModelError::ConfigMismatch(format!("tensor `{}` missing", name)))?;
        if view.dtype() != Dtype::F32 {
            return Err(ModelError::Checkpoint(format!(
                "tensor `{}` has dtype {:?}, expected F32",
                name,
                view.dtype()
            )));
        }
        if view.shape() != expected {
            return Err(ModelError::ConfigMismatch(format!(
                "tensor `{}` has shape {:?}, config implies {:?}",
                name,
                view.shape(),
                expected
            )));
        }
        self.used.insert(name.to_string());
        Ok(view
            .data()
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect())
    }

    fn reject_unused(&self) -> Result<()> {
        let mut extra: Vec<&str> = self
            .tensors
            .names()
            .into_iter()
            .map(String::as_str)
            .filter(|name| !self.used.contains(*name))
            .collect();
        if extra.is_empty() {
            return Ok(());
        }
        extra.sort_unstable();
        Err(ModelError::ConfigMismatch(format!(
            "checkpoint has tensors the config does not use: {}",
            extra.join(", ")
        )))
    }
}

impl ParamSource for TensorSource<'_, '_> {
    fn matrix(&mut self, name: &str, rows: usize, cols: usize) -> Result<Array2<f32>> {
        let values = self.fetch(name, &[rows, cols])?;
        Array2::from_shape_vec((rows, cols), values)
            .map_err(|e| ModelError::Checkpoint(e.to_string()))
    }

    fn vector(&mut self, name: &str, len: usize, _init: f32) -> Result<Array1<f32>> {
        Ok(Array1::from(self.fetch(name, &[len])?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;
    use charformer_kernels::config::Device;

    fn small() -> Checkpoint {
        let config = ModelConfig {
            vocab_size: 4,
            block_size: 6,
            n_embd: 8,
            n_head: 2,
            n_layer: 2,
            dropout: 0.0,
            device: Device::Cpu,
        };
        let model = LanguageModel::random(config, 21).unwrap();
        Checkpoint::new(model, Vocabulary::from_corpus("hey!")).unwrap()
    }

    #[test]
    fn bytes_round_trip_preserves_logits() {
        let original = small();
        let restored = Checkpoint::from_bytes(&original.to_bytes().unwrap()).unwrap();
        assert_eq!(restored.config(), original.config());
        assert_eq!(restored.vocab, original.vocab);

        let ctx = ExecutionContext::cpu().unwrap();
        let a = original.model.forward_sequence(&ctx, &[3, 1, 0, 2]).unwrap();
        let b = restored.model.forward_sequence(&ctx, &[3, 1, 0, 2]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn shape_disagreeing_with_config_is_rejected() {
        let checkpoint = small();
        let mut wrong = checkpoint.config().clone();
        wrong.n_embd = 16;
        let bytes = encode(&wrong, &checkpoint.vocab, &checkpoint.model).unwrap();
        let err = Checkpoint::from_bytes(&bytes).err().unwrap();
        assert_eq!(err.kind(), "config_mismatch");
    }

    #[test]
    fn extra_tensors_are_rejected() {
        let checkpoint = small();
        let mut fewer_layers = checkpoint.config().clone();
        fewer_layers.n_layer = 1;
        let bytes = encode(&fewer_layers, &checkpoint.vocab, &checkpoint.model).unwrap();
        let err = Checkpoint::from_bytes(&bytes).err().unwrap();
        assert_eq!(err.kind(), "config_mismatch");
        assert!(err.to_string().contains("blocks.1"));
    }

    #[test]
    fn vocabulary_size_must_match_config() {
        let checkpoint = small();
        let vocab = Vocabulary::from_corpus("hey");
        let bytes = encode(checkpoint.config(), &vocab, &checkpoint.model).unwrap();
        let err = Checkpoint::from_bytes(&bytes).err().unwrap();
        assert_eq!(err.kind(), "config_mismatch");
    }

    #[test]
    fn garbage_is_a_checkpoint_error() {
        let err = Checkpoint::from_bytes(b"not a checkpoint").err().unwrap();
        assert_eq!(err.kind(), "checkpoint");
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        let checkpoint = small();
        checkpoint.save(&path).unwrap();
        let loaded = Checkpoint::load(&path).unwrap();
        assert_eq!(loaded.config(), checkpoint.config());
        assert!(Checkpoint::load(dir.path().join("missing.safetensors")).is_err());
    }
}
