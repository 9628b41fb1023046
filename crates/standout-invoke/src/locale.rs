//! Process-wide locale settings.
//!
//! Rust has no ambient culture, so the pipeline keeps its own: a formatting
//! locale (`culture`) and a locale for user-facing messages (`ui_culture`).
//! Both live in one process-wide store. The culture directive writes them once
//! per invocation; they are never rolled back. Embedders that run several
//! invocations in one process and need isolation must save and restore the
//! settings around each invocation themselves ([`current`] / [`set`]).
//!
//! An empty tag is the invariant locale.

use std::fmt;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

/// Environment variable forcing the invariant formatting locale.
pub const INVARIANT_CULTURE_VAR: &str = "STANDOUT_INVARIANT_CULTURE";
/// Environment variable forcing the invariant message locale.
pub const INVARIANT_UI_CULTURE_VAR: &str = "STANDOUT_INVARIANT_UI_CULTURE";
/// Environment variable naming the formatting locale.
pub const CULTURE_VAR: &str = "STANDOUT_CULTURE";
/// Environment variable naming the message locale.
pub const UI_CULTURE_VAR: &str = "STANDOUT_UI_CULTURE";

/// A validated locale tag such as `en-US` or `de`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Locale(String);

impl Locale {
    /// The invariant locale.
    pub fn invariant() -> Self {
        Self(String::new())
    }

    /// Parses a tag of the form `language[-subtag]*`.
    ///
    /// The language is 2-8 ASCII letters; each subtag is 1-8 ASCII
    /// alphanumerics. `_` is accepted as a separator. Casing is normalized to
    /// lowercase language, uppercase two-letter region. Returns `None` for
    /// anything else.
    pub fn parse(tag: &str) -> Option<Self> {
        let tag = tag.trim();
        if tag.is_empty() {
            return None;
        }

        let mut parts = tag.split(['-', '_']);
        let language = parts.next()?;
        if !(2..=8).contains(&language.len()) || !language.chars().all(|c| c.is_ascii_alphabetic())
        {
            return None;
        }

        let mut normalized = language.to_ascii_lowercase();
        for part in parts {
            if !(1..=8).contains(&part.len()) || !part.chars().all(|c| c.is_ascii_alphanumeric()) {
                return None;
            }
            normalized.push('-');
            if part.len() == 2 && part.chars().all(|c| c.is_ascii_alphabetic()) {
                normalized.push_str(&part.to_ascii_uppercase());
            } else {
                normalized.push_str(part);
            }
        }

        Some(Self(normalized))
    }

    /// Reads a POSIX locale value such as `de_DE.UTF-8`. `C` and `POSIX`
    /// map to the invariant locale.
    pub fn from_posix(value: &str) -> Option<Self> {
        let base = value.split(['.', '@']).next().unwrap_or_default();
        match base {
            "" => None,
            "C" | "POSIX" => Some(Self::invariant()),
            other => Self::parse(other),
        }
    }

    /// The tag, empty for the invariant locale.
    pub fn tag(&self) -> &str {
        &self.0
    }

    /// The language part (`de` for `de-AT`), empty for the invariant locale.
    pub fn language(&self) -> &str {
        self.0.split('-').next().unwrap_or_default()
    }

    /// Returns true for the invariant locale.
    pub fn is_invariant(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Locale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_invariant() {
            f.write_str("invariant")
        } else {
            f.write_str(&self.0)
        }
    }
}

/// The pair of locales the pipeline tracks.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LocaleSettings {
    /// Locale for formatting numbers, dates and similar values.
    pub culture: Locale,
    /// Locale for user-facing messages.
    pub ui_culture: Locale,
}

impl LocaleSettings {
    /// Both locales set to `locale`.
    pub fn uniform(locale: Locale) -> Self {
        Self {
            culture: locale.clone(),
            ui_culture: locale,
        }
    }

    /// Initial settings derived from `LC_ALL`, `LC_MESSAGES` and `LANG`.
    pub fn from_system() -> Self {
        let system = ["LC_ALL", "LC_MESSAGES", "LANG"]
            .iter()
            .filter_map(|name| std::env::var(name).ok())
            .find_map(|value| Locale::from_posix(&value))
            .unwrap_or_default();
        Self::uniform(system)
    }
}

static SETTINGS: Lazy<RwLock<LocaleSettings>> =
    Lazy::new(|| RwLock::new(LocaleSettings::from_system()));

/// The settings currently in effect.
pub fn current() -> LocaleSettings {
    SETTINGS.read().clone()
}

/// Replaces the settings in effect, returning the previous ones.
pub fn set(settings: LocaleSettings) -> LocaleSettings {
    std::mem::replace(&mut *SETTINGS.write(), settings)
}

/// Sets only the formatting locale.
pub fn set_culture(locale: Locale) {
    SETTINGS.write().culture = locale;
}

/// Sets only the message locale.
pub fn set_ui_culture(locale: Locale) {
    SETTINGS.write().ui_culture = locale;
}

/// Parses a boolean-like environment value: `true`/`false` in any case, or an
/// integer where nonzero means true.
pub fn parse_bool(value: &str) -> Option<bool> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("true") {
        Some(true)
    } else if value.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        value.parse::<i64>().ok().map(|n| n != 0)
    }
}

/// Resets both locales to invariant so messages come out in English.
#[cfg(test)]
pub(crate) fn use_invariant_for_tests() {
    set(LocaleSettings::uniform(Locale::invariant()));
}
