use std::borrow::Cow;

use crate::StreamInfo;

/// One decoded stem of a song.
#[derive(Debug, Clone)]
pub struct AudioComponent {
    pub filename: String,
    /// Interleaved samples in the stream's native channel count.
    pub samples: Vec<i16>,
    pub info: StreamInfo,
}

impl AudioComponent {
    pub fn new(filename: impl Into<String>, samples: Vec<i16>, info: StreamInfo) -> Self {
        Self {
            filename: filename.into(),
            samples,
            info,
        }
    }

    pub fn is_mono(&self) -> bool {
        self.info.channels == 1
    }

    /// Sample count once mono has been spread over two channels.
    pub fn mixed_len(&self) -> usize {
        if self.is_mono() {
            self.samples.len() * 2
        } else {
            self.samples.len()
        }
    }

    /// Samples as they enter the mix: mono input is duplicated to both
    /// channels, anything else passes through.
    fn mix_samples(&self) -> Box<dyn Iterator<Item = i16> + '_> {
        if self.is_mono() {
            Box::new(self.samples.iter().flat_map(|&sample| [sample, sample]))
        } else {
            Box::new(self.samples.iter().copied())
        }
    }
}

/// Mixes all components into one buffer, as if the stems played together.
///
/// Shorter stems are padded with silence up to the longest one and samples
/// are summed with saturation, never wrapping. A single component is returned
/// as-is without copying; an empty slice has nothing to mix.
pub fn combine(components: &[AudioComponent]) -> Option<Cow<'_, [i16]>> {
    match components {
        [] => None,
        [only] => Some(Cow::Borrowed(only.samples.as_slice())),
        _ => {
            let longest = components
                .iter()
                .map(AudioComponent::mixed_len)
                .max()
                .unwrap_or(0);
            let mut mixed = vec![0_i16; longest];
            for component in components {
                for (slot, sample) in mixed.iter_mut().zip(component.mix_samples()) {
                    *slot = slot.saturating_add(sample);
                }
            }
            Some(Cow::Owned(mixed))
        }
    }
}
