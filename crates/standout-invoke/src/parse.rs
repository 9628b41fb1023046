//! Parse results and the clap-backed parser.
//!
//! The pipeline consumes a [`ParseResult`]; it never tokenizes or binds
//! arguments itself. [`Parser`] produces one from raw arguments by:
//!
//! 1. splitting leading `[name]` / `[name:value]` tokens off as [`Directives`];
//! 2. running clap on the rest, with clap's own `--help`/`--version` handling
//!    disabled so the pipeline can short-circuit on them instead;
//! 3. recording tokens clap could not place as *unmatched* and retrying
//!    without them, so the matched command is still known;
//! 4. turning everything else clap rejects into [`ParseError`]s.

use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;

use clap::error::{ContextKind, ContextValue, ErrorKind};
use clap::parser::ValueSource;
use clap::{Arg, ArgAction, ArgMatches, Command};

use crate::resources;

/// Argument id of the built-in help flag.
pub const HELP_ID: &str = "help";
/// Argument id of the built-in version flag.
pub const VERSION_ID: &str = "version";

// ============================================================================
// Directives
// ============================================================================

/// Directives found at the start of the command line.
///
/// Names are stored lowercased; lookups are case-insensitive. A directive
/// given without a value is present with no values; repeated directives
/// accumulate values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Directives {
    map: BTreeMap<String, Vec<String>>,
}

impl Directives {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Splits leading directive tokens off `tokens`.
    ///
    /// Extraction stops at the first token that is not a directive, so a
    /// bracketed value later on the line stays an ordinary argument.
    pub fn extract<I, S>(tokens: I) -> (Directives, Vec<String>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut directives = Directives::new();
        let mut rest = Vec::new();
        let mut in_prefix = true;

        for token in tokens.into_iter().map(Into::into) {
            if in_prefix {
                if let Some((name, value)) = parse_directive(&token) {
                    directives.insert(name, value);
                    continue;
                }
                in_prefix = false;
            }
            rest.push(token);
        }

        (directives, rest)
    }

    /// Records a directive.
    pub fn insert(&mut self, name: &str, value: Option<&str>) {
        let values = self.map.entry(name.to_ascii_lowercase()).or_default();
        if let Some(value) = value {
            values.push(value.to_string());
        }
    }

    /// Returns true if the directive is present.
    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(&name.to_ascii_lowercase())
    }

    /// Values given for the directive, empty if absent or value-less.
    pub fn values(&self, name: &str) -> &[String] {
        self.map
            .get(&name.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Returns true if no directive was given.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Iterates `(name, values)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.map.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}

fn parse_directive(token: &str) -> Option<(&str, Option<&str>)> {
    let inner = token.strip_prefix('[')?.strip_suffix(']')?;
    let (name, value) = match inner.split_once(':') {
        Some((name, value)) => (name, Some(value)),
        None => (inner, None),
    };
    if name.is_empty() || name.chars().any(char::is_whitespace) {
        return None;
    }
    Some((name, value))
}

// ============================================================================
// Parse errors
// ============================================================================

/// One problem found while parsing.
///
/// Messages are rendered on demand so they follow the UI locale in effect
/// when they are displayed, not when the command line was parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// A token nothing matched.
    UnmatchedToken(String),
    /// `--version` given together with other input.
    VersionCombined,
    /// Anything else the parser rejected, with the parser's own message.
    Invalid {
        /// The parser's message, without a trailing usage block.
        message: String,
        /// The offending token, when there is one.
        token: Option<String>,
    },
}

impl ParseError {
    /// A parse error with only a message.
    pub fn new(message: impl Into<String>) -> Self {
        ParseError::Invalid {
            message: message.into(),
            token: None,
        }
    }

    /// The message to display.
    pub fn message(&self) -> String {
        match self {
            ParseError::UnmatchedToken(token) => resources::unrecognized_command_or_argument(token),
            ParseError::VersionCombined => resources::version_cannot_be_combined(),
            ParseError::Invalid { message, .. } => message.clone(),
        }
    }

    /// The offending token, when there is one.
    pub fn token(&self) -> Option<&str> {
        match self {
            ParseError::UnmatchedToken(token) => Some(token),
            ParseError::VersionCombined => None,
            ParseError::Invalid { token, .. } => token.as_deref(),
        }
    }

    fn from_clap(err: &clap::Error) -> Self {
        let rendered = err.to_string();
        let first = rendered.lines().next().unwrap_or_default();
        ParseError::Invalid {
            message: first.strip_prefix("error: ").unwrap_or(first).to_string(),
            token: offending_token(err),
        }
    }
}

fn offending_token(err: &clap::Error) -> Option<String> {
    let kind = match err.kind() {
        ErrorKind::UnknownArgument => ContextKind::InvalidArg,
        ErrorKind::InvalidSubcommand => ContextKind::InvalidSubcommand,
        _ => return None,
    };
    match err.get(kind) {
        Some(ContextValue::String(token)) => Some(token.clone()),
        _ => None,
    }
}

// ============================================================================
// Parse result
// ============================================================================

/// Everything the pipeline knows about one command line.
///
/// Immutable once produced.
#[derive(Debug, Clone)]
pub struct ParseResult {
    command: Arc<Command>,
    directives: Directives,
    tokens: Vec<String>,
    matches: Option<ArgMatches>,
    command_path: Vec<String>,
    unmatched_tokens: Vec<String>,
    errors: Vec<ParseError>,
    treat_unmatched_tokens_as_errors: bool,
    help_registered: bool,
    version_registered: bool,
}

impl ParseResult {
    /// The result of parsing an empty command line against a bare command.
    pub fn empty(name: &'static str) -> Self {
        Parser::new(Command::new(name)).parse(Vec::<String>::new())
    }

    /// Directives given on the command line.
    pub fn directives(&self) -> &Directives {
        &self.directives
    }

    /// The tokens after the program name, excluding directives.
    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// The tokens joined with single spaces.
    pub fn command_line_text(&self) -> String {
        self.tokens.join(" ")
    }

    /// The root clap command, fully built.
    pub fn root_command(&self) -> &Command {
        &self.command
    }

    /// The path of the matched command below the root (`["db", "migrate"]`).
    pub fn command_path(&self) -> &[String] {
        &self.command_path
    }

    /// The command the parse ended on.
    pub fn matched_command(&self) -> &Command {
        let mut current: &Command = &self.command;
        for name in &self.command_path {
            match current.find_subcommand(name) {
                Some(sub) => current = sub,
                None => break,
            }
        }
        current
    }

    /// Root matches, if clap accepted the (possibly reduced) command line.
    pub fn matches(&self) -> Option<&ArgMatches> {
        self.matches.as_ref()
    }

    /// Matches of the deepest matched subcommand.
    pub fn deepest_matches(&self) -> Option<&ArgMatches> {
        self.matches.as_ref().map(get_deepest_matches)
    }

    /// Tokens nothing matched.
    pub fn unmatched_tokens(&self) -> &[String] {
        &self.unmatched_tokens
    }

    /// Parse errors, in the order they were found.
    pub fn errors(&self) -> &[ParseError] {
        &self.errors
    }

    /// Returns true if there is at least one parse error.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Whether the matched command reports unmatched tokens as errors.
    pub fn treats_unmatched_tokens_as_errors(&self) -> bool {
        self.treat_unmatched_tokens_as_errors
    }

    /// Returns true if the built-in help flag was given.
    pub fn help_requested(&self) -> bool {
        self.help_registered && self.deepest_matches().is_some_and(|m| flag_set(m, HELP_ID))
    }

    /// Returns true if the built-in version flag was given.
    pub fn version_requested(&self) -> bool {
        self.version_registered && self.matches().is_some_and(|m| flag_set(m, VERSION_ID))
    }

    /// Renders clap's help for the matched command.
    pub fn render_help(&self) -> String {
        let mut command = self.matched_command().clone();
        command.render_help().to_string()
    }

    /// Identifier groups of the matched command's visible children.
    ///
    /// Each inner vector holds every spelling of one subcommand or option
    /// (`["--verbose", "-v"]`).
    pub fn candidates(&self) -> Vec<Vec<String>> {
        let command = self.matched_command();
        let mut groups = Vec::new();

        for sub in command.get_subcommands().filter(|s| !s.is_hide_set()) {
            let mut names = vec![sub.get_name().to_string()];
            names.extend(sub.get_all_aliases().map(String::from));
            groups.push(names);
        }

        for arg in command
            .get_arguments()
            .filter(|a| !a.is_hide_set() && !a.is_positional())
        {
            let mut names = Vec::new();
            if let Some(long) = arg.get_long() {
                names.push(format!("--{}", long));
            }
            if let Some(aliases) = arg.get_all_aliases() {
                names.extend(aliases.into_iter().map(|a| format!("--{}", a)));
            }
            if let Some(short) = arg.get_short() {
                names.push(format!("-{}", short));
            }
            if !names.is_empty() {
                groups.push(names);
            }
        }

        groups
    }

    /// Completions for the word that ends at `position` in
    /// [`command_line_text`](Self::command_line_text).
    ///
    /// Positions past the end are clamped. Results are sorted and unique.
    pub fn completions(&self, position: usize) -> Vec<String> {
        let text = self.command_line_text();
        let mut position = position.min(text.len());
        while !text.is_char_boundary(position) {
            position -= 1;
        }
        let before = &text[..position];
        let word = before.rsplit(' ').next().unwrap_or_default();

        let mut completions: Vec<String> = self
            .candidates()
            .into_iter()
            .flatten()
            .filter(|candidate| candidate.starts_with(word))
            .collect();
        completions.sort();
        completions.dedup();
        completions
    }

    /// A bracketed rendering of what matched what.
    ///
    /// ```text
    /// [ app [ --name <Ada> ] *[ --greeting <Hello> ] [ shout ] ]   ???--> extra
    /// ```
    ///
    /// `*` marks values that came from defaults, a leading `!` marks a parse
    /// with errors, and `???-->` lists unmatched tokens.
    pub fn diagram(&self) -> String {
        let mut out = String::new();
        if self.has_errors() {
            out.push('!');
        }
        match &self.matches {
            Some(matches) => write_command(&mut out, &self.command, matches),
            None => {
                let _ = write!(out, "[ {} ]", self.command.get_name());
            }
        }
        if !self.unmatched_tokens.is_empty() {
            let _ = write!(out, "   ???--> {}", self.unmatched_tokens.join(" "));
        }
        out
    }
}

fn flag_set(matches: &ArgMatches, id: &str) -> bool {
    matches!(matches.try_get_one::<bool>(id), Ok(Some(true)))
}

fn write_command(out: &mut String, command: &Command, matches: &ArgMatches) {
    let _ = write!(out, "[ {}", command.get_name());

    for arg in command.get_arguments() {
        let id = arg.get_id().as_str();
        let source = match matches.value_source(id) {
            Some(source) => source,
            None => continue,
        };
        let builtin = id == HELP_ID || id == VERSION_ID;
        let marker = match source {
            ValueSource::CommandLine | ValueSource::EnvVariable => "",
            _ if builtin || !arg.get_action().takes_values() => continue,
            _ => "*",
        };

        let label = match (arg.get_long(), arg.get_short()) {
            (Some(long), _) => format!("--{}", long),
            (None, Some(short)) => format!("-{}", short),
            (None, None) => id.to_string(),
        };
        let _ = write!(out, " {}[ {}", marker, label);
        if let Some(raw) = matches.get_raw(id) {
            for value in raw {
                let _ = write!(out, " <{}>", value.to_string_lossy());
            }
        }
        out.push_str(" ]");
    }

    if let Some((name, sub_matches)) = matches.subcommand() {
        if let Some(sub) = command.find_subcommand(name) {
            out.push(' ');
            write_command(out, sub, sub_matches);
        }
    }

    out.push_str(" ]");
}

/// Follows the subcommand chain and returns the matched path.
pub fn extract_command_path(matches: &ArgMatches) -> Vec<String> {
    let mut path = Vec::new();
    let mut current = matches;
    while let Some((name, sub)) = current.subcommand() {
        path.push(name.to_string());
        current = sub;
    }
    path
}

/// Returns the matches of the most deeply nested subcommand.
pub fn get_deepest_matches(matches: &ArgMatches) -> &ArgMatches {
    let mut current = matches;
    while let Some((_, sub)) = current.subcommand() {
        current = sub;
    }
    current
}

/// Converts a command path to a dot-separated key (`db.migrate`).
pub fn path_to_string(path: &[String]) -> String {
    path.join(".")
}

// ============================================================================
// Parser
// ============================================================================

/// Produces [`ParseResult`]s from raw arguments using a clap [`Command`].
#[derive(Debug, Clone)]
pub struct Parser {
    command: Command,
    built: Arc<Command>,
    help_registered: bool,
    version_registered: bool,
    tolerant_paths: HashSet<String>,
}

impl Parser {
    /// Wraps `command` without the built-in help and version flags.
    pub fn new(command: Command) -> Self {
        Self::configure(command, false, false, HashSet::new())
    }

    /// Wraps `command`, registering `-h/--help` (global) and `--version`
    /// (root only) unless the command already defines them.
    pub fn with_options(command: Command, help: bool, version: bool) -> Self {
        Self::configure(command, help, version, HashSet::new())
    }

    /// Lets the command at `path` (dot-separated, `""` for the root) accept
    /// unmatched tokens without reporting them as parse errors.
    pub fn allow_unmatched_tokens(mut self, path: impl Into<String>) -> Self {
        self.tolerant_paths.insert(path.into());
        self
    }

    fn configure(command: Command, help: bool, version: bool, tolerant: HashSet<String>) -> Self {
        let mut command = disable_builtin_flags(command).disable_help_subcommand(true);

        let help_registered = help && !defines_long(&command, "help");
        if help_registered {
            command = command.arg(
                Arg::new(HELP_ID)
                    .short('h')
                    .long("help")
                    .action(ArgAction::SetTrue)
                    .global(true)
                    .help(resources::help_description()),
            );
        }

        let version_registered = version && !defines_long(&command, "version");
        if version_registered {
            command = command.arg(
                Arg::new(VERSION_ID)
                    .long("version")
                    .action(ArgAction::SetTrue)
                    .help(resources::version_description()),
            );
        }

        let mut built = command.clone();
        built.build();

        Self {
            command,
            built: Arc::new(built),
            help_registered,
            version_registered,
            tolerant_paths: tolerant,
        }
    }

    /// The augmented command.
    pub fn command(&self) -> &Command {
        &self.command
    }

    /// Parses `args`. The first element is the program name.
    pub fn parse<I, T>(&self, args: I) -> ParseResult
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let mut args = args.into_iter().map(Into::into);
        let program = args
            .next()
            .unwrap_or_else(|| self.command.get_name().to_string());
        let (directives, tokens) = Directives::extract(args);

        let mut remaining = tokens.clone();
        let mut unmatched_tokens = Vec::new();
        let mut errors = Vec::new();

        let matches = loop {
            let argv = std::iter::once(program.clone()).chain(remaining.iter().cloned());
            match self.command.clone().try_get_matches_from(argv) {
                Ok(matches) => break Some(matches),
                Err(err) => {
                    if let Some(position) = unknown_token_position(&err, &remaining) {
                        unmatched_tokens.push(remaining.remove(position));
                        continue;
                    }
                    errors.push(ParseError::from_clap(&err));
                    break None;
                }
            }
        };

        let command_path = matches
            .as_ref()
            .map(extract_command_path)
            .unwrap_or_default();
        let treat_unmatched_tokens_as_errors =
            !self.tolerant_paths.contains(&path_to_string(&command_path));

        if treat_unmatched_tokens_as_errors && !unmatched_tokens.is_empty() {
            let mut reported: Vec<ParseError> =
                unmatched_tokens.iter().cloned().map(ParseError::UnmatchedToken).collect();
            reported.append(&mut errors);
            errors = reported;
        }

        if self.version_registered {
            if let Some(root) = &matches {
                if flag_set(root, VERSION_ID) && has_other_input(&self.built, root) {
                    errors.push(ParseError::VersionCombined);
                }
            }
        }

        ParseResult {
            command: Arc::clone(&self.built),
            directives,
            tokens,
            matches,
            command_path,
            unmatched_tokens,
            errors,
            treat_unmatched_tokens_as_errors,
            help_registered: self.help_registered,
            version_registered: self.version_registered,
        }
    }
}

fn disable_builtin_flags(command: Command) -> Command {
    let names: Vec<String> = command
        .get_subcommands()
        .map(|sub| sub.get_name().to_string())
        .collect();
    let mut command = command.disable_help_flag(true).disable_version_flag(true);
    for name in names {
        command = command.mut_subcommand(name, disable_builtin_flags);
    }
    command
}

fn defines_long(command: &Command, long: &str) -> bool {
    command
        .get_arguments()
        .any(|arg| arg.get_long() == Some(long) || arg.get_id().as_str() == long)
}

fn unknown_token_position(err: &clap::Error, remaining: &[String]) -> Option<usize> {
    let token = offending_token(err)?;
    let with_value = format!("{}=", token);
    remaining
        .iter()
        .position(|t| *t == token || t.starts_with(&with_value))
}

fn has_other_input(root: &Command, matches: &ArgMatches) -> bool {
    if matches.subcommand().is_some() {
        return true;
    }
    root.get_arguments()
        .map(|arg| arg.get_id().as_str())
        .filter(|id| *id != VERSION_ID)
        .any(|id| matches.value_source(id) == Some(ValueSource::CommandLine))
}
