//! Capture and restore of ambient configuration around deferred results.
//!
//! A step may decide what the invocation prints long before the output is
//! actually written: results are applied only after the whole chain unwound.
//! Anything that changed the process locale in between (a handler, an
//! embedding host) would otherwise leak into output that was decided under
//! different settings.
//!
//! [`AmbientSnapshot`] is an explicit copy of that configuration, and
//! [`RestoringResult`] re-installs it for exactly the duration of
//! [`InvocationResult::apply`].

use std::io;

use crate::context::InvocationContext;
use crate::locale::{self, LocaleSettings};
use crate::result::InvocationResult;

/// A copy of the ambient configuration at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmbientSnapshot {
    locale: LocaleSettings,
}

impl AmbientSnapshot {
    /// Captures the configuration currently in effect.
    pub fn capture() -> Self {
        Self {
            locale: locale::current(),
        }
    }

    /// A snapshot holding the given locale settings.
    pub fn from_locale(locale: LocaleSettings) -> Self {
        Self { locale }
    }

    /// The captured locale settings.
    pub fn locale(&self) -> &LocaleSettings {
        &self.locale
    }

    /// Installs this snapshot until the returned guard is dropped.
    pub fn enter(&self) -> AmbientGuard {
        AmbientGuard {
            previous: Some(locale::set(self.locale.clone())),
        }
    }
}

/// Restores the previously active configuration on drop.
#[must_use = "the snapshot is only active while the guard is alive"]
pub struct AmbientGuard {
    previous: Option<LocaleSettings>,
}

impl Drop for AmbientGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            locale::set(previous);
        }
    }
}

/// A deferred result that is applied under a captured snapshot.
pub struct RestoringResult {
    inner: Box<dyn InvocationResult>,
    snapshot: Option<AmbientSnapshot>,
}

impl RestoringResult {
    /// Wraps `inner`. With `None`, apply runs against whatever is current.
    pub fn new(inner: Box<dyn InvocationResult>, snapshot: Option<AmbientSnapshot>) -> Self {
        Self { inner, snapshot }
    }

    /// The snapshot the inner result will be applied under, if any.
    pub fn snapshot(&self) -> Option<&AmbientSnapshot> {
        self.snapshot.as_ref()
    }
}

impl InvocationResult for RestoringResult {
    fn apply(&self, ctx: &mut InvocationContext) -> io::Result<()> {
        match &self.snapshot {
            Some(snapshot) => {
                let _guard = snapshot.enter();
                self.inner.apply(ctx)
            }
            None => self.inner.apply(ctx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::BufferConsole;
    use crate::locale::Locale;
    use crate::parse::ParseResult;
    use serial_test::serial;
    use std::io::Write;

    struct PrintUiCulture;

    impl InvocationResult for PrintUiCulture {
        fn apply(&self, ctx: &mut InvocationContext) -> io::Result<()> {
            let tag = locale::current().ui_culture.to_string();
            writeln!(ctx.console().out(), "{}", tag)
        }
    }

    fn settings(tag: &str) -> LocaleSettings {
        LocaleSettings::uniform(Locale::parse(tag).unwrap())
    }

    #[test]
    #[serial]
    fn test_apply_under_snapshot_then_restore() {
        let original = locale::set(settings("de-DE"));
        let snapshot = AmbientSnapshot::capture();

        // Something changes the locale between decision and output.
        locale::set(settings("fr-FR"));

        let console = BufferConsole::new();
        let mut ctx = InvocationContext::new(ParseResult::empty("app"), Box::new(console.clone()));
        RestoringResult::new(Box::new(PrintUiCulture), Some(snapshot)).apply(&mut ctx).unwrap();

        assert_eq!(console.out_text(), "de-DE\n");
        assert_eq!(locale::current(), settings("fr-FR"));

        locale::set(original);
    }

    #[test]
    #[serial]
    fn test_apply_without_snapshot_uses_current() {
        let original = locale::set(settings("es"));

        let console = BufferConsole::new();
        let mut ctx = InvocationContext::new(ParseResult::empty("app"), Box::new(console.clone()));
        RestoringResult::new(Box::new(PrintUiCulture), None).apply(&mut ctx).unwrap();

        assert_eq!(console.out_text(), "es\n");
        locale::set(original);
    }

    #[test]
    #[serial]
    fn test_guard_restores_on_drop() {
        let original = locale::set(settings("en-US"));
        {
            let _guard = AmbientSnapshot::from_locale(settings("fr")).enter();
            assert_eq!(locale::current(), settings("fr"));
        }
        assert_eq!(locale::current(), settings("en-US"));
        locale::set(original);
    }
}
