//! The two on-air personas.
//!
//! Speaker identity is a pure function of the turn number: odd turns belong
//! to role A, even turns to role B.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Role of a speaker in the stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Speaker {
    A,
    B,
}

impl Speaker {
    /// Speaker for a 1-based turn number.
    pub fn for_turn(turn_id: u64) -> Self {
        if turn_id % 2 == 1 { Speaker::A } else { Speaker::B }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Speaker::A => "A",
            Speaker::B => "B",
        }
    }

    pub fn other(&self) -> Self {
        match self {
            Speaker::A => Speaker::B,
            Speaker::B => Speaker::A,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "A" => Some(Speaker::A),
            "B" => Some(Speaker::B),
            _ => None,
        }
    }
}

impl fmt::Display for Speaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persona voiced by one speaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    /// Display name (used in overlays and console output).
    pub name: String,
    /// Style/persona instruction block; `{topic}` is expanded.
    pub system_prompt: String,
    /// TTS voice id.
    pub voice: String,
    /// Utterance used when generation or synthesis gives up.
    pub bridge_phrase: String,
}

impl Persona {
    pub fn new(name: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            system_prompt: system_prompt.into(),
            voice: String::new(),
            bridge_phrase: String::new(),
        }
    }

    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = voice.into();
        self
    }

    pub fn with_bridge_phrase(mut self, phrase: impl Into<String>) -> Self {
        self.bridge_phrase = phrase.into();
        self
    }

    /// System prompt with placeholders replaced.
    pub fn render_system_prompt(&self, topic: &str) -> String {
        self.system_prompt
            .replace("{name}", &self.name)
            .replace("{topic}", topic)
    }
}

/// Both personas, addressable by speaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Personas {
    pub a: Persona,
    pub b: Persona,
}

impl Personas {
    pub fn get(&self, speaker: Speaker) -> &Persona {
        match speaker {
            Speaker::A => &self.a,
            Speaker::B => &self.b,
        }
    }
}
