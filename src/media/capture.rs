use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait};
use tracing::{debug, info};

use super::{LocalTrack, MediaConstraints, MediaDevices};
use crate::error::MediaError;
use crate::types::TrackSource;

/// Capture devices of the host machine.
///
/// Audio input is discovered through cpal. There is no portable camera API
/// here, so video is only offered when explicitly enabled.
///
/// Only device discovery happens here. No samples are captured or written
/// to the returned tracks; they negotiate media sections and carry the
/// enabled flag, and an encoder feeding `LocalTrack::rtc_track` is up to
/// the embedding application.
#[derive(Debug, Clone, Default)]
pub struct SystemMediaDevices {
    camera: bool,
}

impl SystemMediaDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_camera(mut self, available: bool) -> Self {
        self.camera = available;
        self
    }
}

fn probe_microphone() -> Result<String, MediaError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| MediaError::NotFound("microphone".into()))?;

    let config = device
        .default_input_config()
        .map_err(|e| MediaError::Device(e.to_string()))?;
    let name = device.name().unwrap_or_else(|_| "default".to_owned());
    debug!("input device {} config: {:?}", name, config);
    Ok(name)
}

#[async_trait]
impl MediaDevices for SystemMediaDevices {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Vec<LocalTrack>, MediaError> {
        if constraints.video && !self.camera {
            return Err(MediaError::NotFound("camera".into()));
        }

        let mut tracks = Vec::new();
        if constraints.audio {
            let name = tokio::task::spawn_blocking(probe_microphone)
                .await
                .map_err(|e| MediaError::Device(e.to_string()))??;
            info!("capturing audio from {}", name);
            tracks.push(LocalTrack::new(TrackSource::Microphone));
        }
        if constraints.video {
            tracks.push(LocalTrack::new(TrackSource::Camera));
        }
        Ok(tracks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MediaKind;

    fn video_only() -> MediaConstraints {
        MediaConstraints {
            audio: false,
            video: true,
        }
    }

    #[tokio::test]
    async fn camera_is_offered_only_when_enabled() {
        let err = SystemMediaDevices::new()
            .get_user_media(&video_only())
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::NotFound(ref what) if what == "camera"));

        let tracks = SystemMediaDevices::new()
            .with_camera(true)
            .get_user_media(&video_only())
            .await
            .unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].source(), TrackSource::Camera);
        assert_eq!(tracks[0].kind(), MediaKind::Video);
        assert!(tracks[0].is_enabled());
    }
}
