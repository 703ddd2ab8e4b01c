//! Model Catalog
//!
//! Names, default construction keys, and naming rules of the models the
//! generation pipeline knows how to cache.

use serde::{Deserialize, Serialize};

use crate::core::Device;

/// Known model resource types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    /// Speech-to-text (subtitles)
    Whisper,
    /// Sentence embeddings for semantic clip matching
    SentenceTransformer,
    /// Image-text similarity
    Clip,
    /// Text-to-speech
    Chatterbox,
}

impl ModelKind {
    pub const ALL: [ModelKind; 4] = [
        ModelKind::Whisper,
        ModelKind::SentenceTransformer,
        ModelKind::Clip,
        ModelKind::Chatterbox,
    ];

    /// Cache resource name
    pub fn name(&self) -> &'static str {
        match self {
            ModelKind::Whisper => "whisper",
            ModelKind::SentenceTransformer => "sentence_transformer",
            ModelKind::Clip => "clip",
            ModelKind::Chatterbox => "chatterbox",
        }
    }

    /// Construction key used when none is configured
    pub fn default_key(&self) -> &'static str {
        match self {
            ModelKind::Whisper => "large-v3",
            ModelKind::SentenceTransformer => "all-mpnet-base-v2",
            ModelKind::Clip => "clip-vit-base-patch32",
            ModelKind::Chatterbox => "chatterbox-tts",
        }
    }
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for ModelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "whisper" => Ok(ModelKind::Whisper),
            "sentence_transformer" | "sentence-transformer" => Ok(ModelKind::SentenceTransformer),
            "clip" => Ok(ModelKind::Clip),
            "chatterbox" => Ok(ModelKind::Chatterbox),
            other => Err(format!("Unknown model: {}", other)),
        }
    }
}

/// Maps CLIP short names to hub model ids. Unknown names pass through.
pub fn clip_hub_id(model_name: &str) -> &str {
    match model_name {
        "clip-vit-base-patch32" => "openai/clip-vit-base-patch32",
        "clip-vit-base-patch16" => "openai/clip-vit-base-patch16",
        "clip-vit-large-patch14" => "openai/clip-vit-large-patch14",
        other => other,
    }
}

/// Numeric precision used for Whisper inference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeType {
    Float16,
    Float32,
    Int8,
}

impl ComputeType {
    /// float16 on accelerators for speed, int8 on CPU for memory
    pub fn for_device(device: Device) -> Self {
        if device.is_accelerator() {
            ComputeType::Float16
        } else {
            ComputeType::Int8
        }
    }

    /// Configured override wins over the device default
    pub fn resolve(configured: Option<ComputeType>, device: Device) -> Self {
        configured.unwrap_or_else(|| Self::for_device(device))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ComputeType::Float16 => "float16",
            ComputeType::Float32 => "float32",
            ComputeType::Int8 => "int8",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_kind_round_trip_names() {
        for kind in ModelKind::ALL {
            assert_eq!(kind.name().parse::<ModelKind>(), Ok(kind));
        }
        assert!("llama".parse::<ModelKind>().is_err());
    }

    #[test]
    fn test_default_keys() {
        assert_eq!(ModelKind::Whisper.default_key(), "large-v3");
        assert_eq!(ModelKind::SentenceTransformer.default_key(), "all-mpnet-base-v2");
        assert_eq!(ModelKind::Clip.default_key(), "clip-vit-base-patch32");
    }

    #[test]
    fn test_clip_hub_id_mapping() {
        assert_eq!(clip_hub_id("clip-vit-large-patch14"), "openai/clip-vit-large-patch14");
        assert_eq!(clip_hub_id("laion/CLIP-ViT-H-14"), "laion/CLIP-ViT-H-14");
    }

    #[test]
    fn test_compute_type_by_device() {
        assert_eq!(ComputeType::for_device(Device::Cuda), ComputeType::Float16);
        assert_eq!(ComputeType::for_device(Device::Cpu), ComputeType::Int8);
        assert_eq!(
            ComputeType::resolve(Some(ComputeType::Float32), Device::Cuda),
            ComputeType::Float32
        );
    }
}
