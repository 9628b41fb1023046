//! User-facing framework messages.
//!
//! Messages are chosen by the language of the active UI locale at the time
//! they are produced, which is why deferred results are applied under the
//! snapshot captured when the locale was configured. Unknown languages fall
//! back to English.

use crate::locale;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lang {
    En,
    De,
    Fr,
}

fn lang() -> Lang {
    match locale::current().ui_culture.language() {
        "de" => Lang::De,
        "fr" => Lang::Fr,
        _ => Lang::En,
    }
}

/// Parse error for a token nothing matched.
pub fn unrecognized_command_or_argument(token: &str) -> String {
    match lang() {
        Lang::En => format!("Unrecognized command or argument '{}'.", token),
        Lang::De => format!("Unbekannter Befehl oder unbekanntes Argument '{}'.", token),
        Lang::Fr => format!("Commande ou argument non reconnu '{}'.", token),
    }
}

/// Header printed above typo suggestions.
pub fn suggestion_header(token: &str) -> String {
    match lang() {
        Lang::En => format!(
            "'{}' was not matched. Did you mean one of the following?",
            token
        ),
        Lang::De => format!(
            "'{}' wurde nicht erkannt. Meinten Sie eines der folgenden?",
            token
        ),
        Lang::Fr => format!(
            "'{}' n'a pas été reconnu. Vouliez-vous dire l'un des suivants ?",
            token
        ),
    }
}

/// Prefix of the default unhandled-failure message.
pub fn exception_header() -> &'static str {
    match lang() {
        Lang::En => "Unhandled exception: ",
        Lang::De => "Unbehandelte Ausnahme: ",
        Lang::Fr => "Exception non gérée : ",
    }
}

/// Parse error when `--version` is mixed with other input.
pub fn version_cannot_be_combined() -> String {
    match lang() {
        Lang::En => "--version option cannot be combined with other arguments.".to_string(),
        Lang::De => "Die Option --version kann nicht mit anderen Argumenten kombiniert werden."
            .to_string(),
        Lang::Fr => "L'option --version ne peut pas être combinée avec d'autres arguments."
            .to_string(),
    }
}

/// Printed by the debug directive before waiting for a debugger.
pub fn debug_attach(pid: u32, name: &str) -> String {
    match lang() {
        Lang::En => format!("Attach your debugger to process {} ({}).", pid, name),
        Lang::De => format!("Verbinden Sie Ihren Debugger mit Prozess {} ({}).", pid, name),
        Lang::Fr => format!("Attachez votre débogueur au processus {} ({}).", pid, name),
    }
}

/// Description of the built-in help flag.
pub fn help_description() -> &'static str {
    match lang() {
        Lang::En => "Show help and usage information",
        Lang::De => "Hilfe und Nutzungsinformationen anzeigen",
        Lang::Fr => "Afficher l'aide et les informations d'utilisation",
    }
}

/// Description of the built-in version flag.
pub fn version_description() -> &'static str {
    match lang() {
        Lang::En => "Show version information",
        Lang::De => "Versionsinformationen anzeigen",
        Lang::Fr => "Afficher les informations de version",
    }
}
