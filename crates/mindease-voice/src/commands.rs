//! Spoken command classification.
//!
//! A final transcript is a command only when its normalized form is short
//! (three words or fewer) and equals, or starts with, one of the phrases
//! below. Anything else is sent as a chat message.

use std::fmt;

/// Longest transcript, in words, that can still be a command.
pub const MAX_COMMAND_WORDS: usize = 3;

/// Step applied by the rate and volume commands.
pub const ADJUST_STEP: f32 = 0.1;

pub const MIN_RATE: f32 = 0.1;
pub const MAX_RATE: f32 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VoiceCommand {
    Stop,
    Pause,
    Resume,
    Repeat,
    Slower,
    Faster,
    Louder,
    Quieter,
}

const VOCABULARY: &[(VoiceCommand, &[&str])] = &[
    (VoiceCommand::Stop, &["stop", "halt", "end", "quit", "cancel"]),
    (VoiceCommand::Pause, &["pause", "wait", "hold"]),
    (VoiceCommand::Resume, &["resume", "continue", "go on", "play"]),
    (
        VoiceCommand::Repeat,
        &["repeat", "say again", "replay", "read again"],
    ),
    (
        VoiceCommand::Slower,
        &["slower", "slow down", "reduce speed"],
    ),
    (
        VoiceCommand::Faster,
        &["faster", "speed up", "increase speed"],
    ),
    (
        VoiceCommand::Louder,
        &["louder", "increase volume", "volume up"],
    ),
    (
        VoiceCommand::Quieter,
        &["quieter", "reduce volume", "volume down", "lower volume"],
    ),
];

impl fmt::Display for VoiceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VoiceCommand::Stop => "stop",
            VoiceCommand::Pause => "pause",
            VoiceCommand::Resume => "resume",
            VoiceCommand::Repeat => "repeat",
            VoiceCommand::Slower => "slower",
            VoiceCommand::Faster => "faster",
            VoiceCommand::Louder => "louder",
            VoiceCommand::Quieter => "quieter",
        };
        write!(f, "{}", name)
    }
}

impl VoiceCommand {
    /// New speech rate after this command, or `None` if it does not touch
    /// the rate.
    pub fn adjust_rate(&self, rate: f32) -> Option<f32> {
        let next = match self {
            VoiceCommand::Slower => rate - ADJUST_STEP,
            VoiceCommand::Faster => rate + ADJUST_STEP,
            _ => return None,
        };
        Some(round_tenth(next.clamp(MIN_RATE, MAX_RATE)))
    }

    /// New volume after this command, or `None` if it does not touch volume.
    pub fn adjust_volume(&self, volume: f32) -> Option<f32> {
        let next = match self {
            VoiceCommand::Quieter => volume - ADJUST_STEP,
            VoiceCommand::Louder => volume + ADJUST_STEP,
            _ => return None,
        };
        Some(round_tenth(next.clamp(0.0, 1.0)))
    }
}

fn round_tenth(value: f32) -> f32 {
    (value * 10.0).round() / 10.0
}

/// Lowercase, drop punctuation, collapse whitespace.
pub fn normalize_transcript(text: &str) -> String {
    let cleaned: String = text
        .chars()
        .filter(|c| !c.is_ascii_punctuation())
        .flat_map(char::to_lowercase)
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Classify a final transcript.
pub fn classify(text: &str) -> Option<VoiceCommand> {
    let normalized = normalize_transcript(text);
    if normalized.is_empty() || normalized.split(' ').count() > MAX_COMMAND_WORDS {
        return None;
    }
    VOCABULARY.iter().find_map(|(command, phrases)| {
        phrases
            .iter()
            .any(|phrase| {
                normalized == *phrase
                    || normalized
                        .strip_prefix(phrase)
                        .is_some_and(|rest| rest.starts_with(' '))
            })
            .then_some(*command)
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_word_commands() {
        assert_eq!(classify("stop"), Some(VoiceCommand::Stop));
        assert_eq!(classify("Pause."), Some(VoiceCommand::Pause));
        assert_eq!(classify("  LOUDER!  "), Some(VoiceCommand::Louder));
        assert_eq!(classify("replay"), Some(VoiceCommand::Repeat));
    }

    #[test]
    fn test_phrases_and_prefixes() {
        assert_eq!(classify("slow down"), Some(VoiceCommand::Slower));
        assert_eq!(classify("go on please"), Some(VoiceCommand::Resume));
        assert_eq!(classify("volume down"), Some(VoiceCommand::Quieter));
        assert_eq!(classify("stop it now"), Some(VoiceCommand::Stop));
    }

    #[test]
    fn test_long_transcript_is_a_message() {
        assert_eq!(
            classify("please stop the bot right now because I am done"),
            None
        );
        assert_eq!(classify("stop it right now"), None);
    }

    #[test]
    fn test_non_commands() {
        assert_eq!(classify(""), None);
        assert_eq!(classify("hello"), None);
        assert_eq!(classify("stopping"), None);
        assert_eq!(classify("I feel sad"), None);
    }

    #[test]
    fn test_normalize_transcript() {
        assert_eq!(normalize_transcript("  Say   AGAIN?! "), "say again");
        assert_eq!(normalize_transcript("..."), "");
    }

    #[test]
    fn test_rate_adjustment_is_clamped() {
        assert_eq!(VoiceCommand::Faster.adjust_rate(1.0), Some(1.1));
        assert_eq!(VoiceCommand::Slower.adjust_rate(1.0), Some(0.9));
        assert_eq!(VoiceCommand::Faster.adjust_rate(2.0), Some(2.0));
        assert_eq!(VoiceCommand::Slower.adjust_rate(0.1), Some(0.1));
        assert_eq!(VoiceCommand::Louder.adjust_rate(1.0), None);
    }

    #[test]
    fn test_volume_adjustment_is_clamped() {
        assert_eq!(VoiceCommand::Quieter.adjust_volume(0.5), Some(0.4));
        assert_eq!(VoiceCommand::Louder.adjust_volume(1.0), Some(1.0));
        assert_eq!(VoiceCommand::Quieter.adjust_volume(0.0), Some(0.0));
        assert_eq!(VoiceCommand::Stop.adjust_volume(0.5), None);
    }
}
