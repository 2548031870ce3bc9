//! Closed catalogs of models, worker queues and billable endpoints.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::CoreError;

/// Worker queue a model executes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Queue {
    Image,
    Video,
    Audio,
}

impl Queue {
    pub const ALL: [Queue; 3] = [Self::Image, Self::Video, Self::Audio];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }
}

impl fmt::Display for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every generative model the service knows how to run.
///
/// Dispatch is keyed on this enum rather than on free-form strings, so a
/// model that is missing a loader or backend is caught when the engine is
/// assembled instead of when the first request arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    // video
    LtxVideo,
    HunyuanVideo,
    Cogvideox,
    Animatediff,
    // image
    FluxSchnell,
    FluxDev,
    Sd35Large,
    // audio
    Kokoro,
    F5Tts,
    Rvc,
    AudiocraftAudiogen,
    Demucs,
    DubbingPipeline,
    // character
    LivePortrait,
}

impl ModelKind {
    pub const ALL: [ModelKind; 14] = [
        Self::LtxVideo,
        Self::HunyuanVideo,
        Self::Cogvideox,
        Self::Animatediff,
        Self::FluxSchnell,
        Self::FluxDev,
        Self::Sd35Large,
        Self::Kokoro,
        Self::F5Tts,
        Self::Rvc,
        Self::AudiocraftAudiogen,
        Self::Demucs,
        Self::DubbingPipeline,
        Self::LivePortrait,
    ];

    /// Identifier used on the wire and in configuration files.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LtxVideo => "ltx_video",
            Self::HunyuanVideo => "hunyuan_video",
            Self::Cogvideox => "cogvideox",
            Self::Animatediff => "animatediff",
            Self::FluxSchnell => "flux_schnell",
            Self::FluxDev => "flux_dev",
            Self::Sd35Large => "sd35_large",
            Self::Kokoro => "kokoro",
            Self::F5Tts => "f5_tts",
            Self::Rvc => "rvc",
            Self::AudiocraftAudiogen => "audiocraft_audiogen",
            Self::Demucs => "demucs",
            Self::DubbingPipeline => "dubbing_pipeline",
            Self::LivePortrait => "live_portrait",
        }
    }

    /// Queue whose workers run this model.
    ///
    /// Character performance shares the audio workers.
    pub fn queue(&self) -> Queue {
        match self {
            Self::LtxVideo | Self::HunyuanVideo | Self::Cogvideox | Self::Animatediff => {
                Queue::Video
            }
            Self::FluxSchnell | Self::FluxDev | Self::Sd35Large => Queue::Image,
            Self::Kokoro
            | Self::F5Tts
            | Self::Rvc
            | Self::AudiocraftAudiogen
            | Self::Demucs
            | Self::DubbingPipeline
            | Self::LivePortrait => Queue::Audio,
        }
    }

    /// Default memory footprint in GB of accelerator memory.
    ///
    /// Deployments override these through configuration; the defaults match
    /// fp16 weights on a single device.
    pub fn default_footprint(&self) -> u64 {
        match self {
            Self::LtxVideo => 10,
            Self::HunyuanVideo => 24,
            Self::Cogvideox => 12,
            Self::Animatediff => 6,
            Self::FluxSchnell => 4,
            Self::FluxDev => 7,
            Self::Sd35Large => 16,
            Self::Kokoro => 1,
            Self::F5Tts => 2,
            Self::Rvc => 1,
            Self::AudiocraftAudiogen => 4,
            Self::Demucs => 1,
            Self::DubbingPipeline => 6,
            Self::LivePortrait => 3,
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| CoreError::UnknownModel(s.to_string()))
    }
}

/// Billable API endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    ImageToVideo,
    TextToVideo,
    VideoToVideo,
    TextToImage,
    CharacterPerformance,
    TextToSpeech,
    SpeechToSpeech,
    SoundEffect,
    VoiceIsolation,
    VoiceDubbing,
}

impl Endpoint {
    pub const ALL: [Endpoint; 10] = [
        Self::ImageToVideo,
        Self::TextToVideo,
        Self::VideoToVideo,
        Self::TextToImage,
        Self::CharacterPerformance,
        Self::TextToSpeech,
        Self::SpeechToSpeech,
        Self::SoundEffect,
        Self::VoiceIsolation,
        Self::VoiceDubbing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ImageToVideo => "image_to_video",
            Self::TextToVideo => "text_to_video",
            Self::VideoToVideo => "video_to_video",
            Self::TextToImage => "text_to_image",
            Self::CharacterPerformance => "character_performance",
            Self::TextToSpeech => "text_to_speech",
            Self::SpeechToSpeech => "speech_to_speech",
            Self::SoundEffect => "sound_effect",
            Self::VoiceIsolation => "voice_isolation",
            Self::VoiceDubbing => "voice_dubbing",
        }
    }

    /// Model used when a request to this endpoint does not name one.
    pub fn default_model(&self) -> Option<ModelKind> {
        match self {
            Self::ImageToVideo | Self::TextToVideo | Self::TextToImage => None,
            Self::VideoToVideo => Some(ModelKind::Animatediff),
            Self::CharacterPerformance => Some(ModelKind::LivePortrait),
            Self::TextToSpeech => Some(ModelKind::Kokoro),
            Self::SpeechToSpeech => Some(ModelKind::Rvc),
            Self::SoundEffect => Some(ModelKind::AudiocraftAudiogen),
            Self::VoiceIsolation => Some(ModelKind::Demucs),
            Self::VoiceDubbing => Some(ModelKind::DubbingPipeline),
        }
    }

    /// Default credit cost of one request.
    pub fn default_cost(&self) -> u64 {
        match self {
            Self::ImageToVideo | Self::TextToVideo | Self::CharacterPerformance => 5,
            Self::VideoToVideo => 8,
            Self::TextToImage | Self::SpeechToSpeech | Self::SoundEffect => 2,
            Self::TextToSpeech | Self::VoiceIsolation => 1,
            Self::VoiceDubbing => 20,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Endpoint {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|e| e.as_str() == s)
            .ok_or_else(|| CoreError::UnknownEndpoint(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_parse() {
        assert_eq!("kokoro".parse::<ModelKind>().unwrap(), ModelKind::Kokoro);
        assert_eq!(
            "gen4_turbo".parse::<ModelKind>(),
            Err(CoreError::UnknownModel("gen4_turbo".to_string()))
        );
    }

    #[test]
    fn test_model_names_round_trip_through_serde() {
        for model in ModelKind::ALL {
            let json = serde_json::to_string(&model).unwrap();
            assert_eq!(json, format!("\"{}\"", model.as_str()));
        }
    }

    #[test]
    fn test_queue_routing() {
        assert_eq!(ModelKind::FluxDev.queue(), Queue::Image);
        assert_eq!(ModelKind::HunyuanVideo.queue(), Queue::Video);
        assert_eq!(ModelKind::LivePortrait.queue(), Queue::Audio);
    }

    #[test]
    fn test_endpoint_costs_in_range() {
        for endpoint in Endpoint::ALL {
            let cost = endpoint.default_cost();
            assert!((1..=20).contains(&cost), "{endpoint} costs {cost}");
        }
        assert_eq!("voice_dubbing".parse::<Endpoint>().unwrap().default_cost(), 20);
    }

    #[test]
    fn test_endpoint_default_models() {
        assert_eq!(Endpoint::TextToSpeech.default_model(), Some(ModelKind::Kokoro));
        assert_eq!(Endpoint::TextToImage.default_model(), None);
    }
}
