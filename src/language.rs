//! Supported languages and their on-disk layout inside a staged directory.

use std::fmt;
use std::str::FromStr;

use crate::error::SubmitError;

/// The closed set of languages a run may target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    Python,
    Cpp,
    Java,
}

impl Language {
    pub const ALL: [Language; 3] = [Language::Python, Language::Cpp, Language::Java];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Cpp => "cpp",
            Language::Java => "java",
        }
    }

    /// Entry file name the language image expects to find in its working directory.
    pub fn entry_file(&self) -> &'static str {
        match self {
            Language::Python => "Main.py",
            Language::Cpp => "Main.cpp",
            Language::Java => "Main.java",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = SubmitError;

    /// Case-insensitive; surrounding whitespace is ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        Language::ALL
            .into_iter()
            .find(|lang| lang.as_str() == normalized)
            .ok_or_else(|| SubmitError::InvalidLanguage(s.to_string()))
    }
}
