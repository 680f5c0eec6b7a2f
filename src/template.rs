//! Request templating.
//!
//! The dynamic fields of a configuration (url, body, header values, and the
//! shell command) are parsed once at run start and executed cheaply for
//! every request. Execution receives a struct-shaped context with the
//! virtual-user and request identities:
//!
//!  - `{{userID}}` expands to the virtual user's id. In closed-loop mode
//!    this is stable for the lifetime of the worker; in open-loop mode a
//!    fresh identity is generated per request, so `{{userID}}` is NOT
//!    stable across requests there.
//!  - `{{requestID}}` (alias `{{uuid}}`) expands to a fresh id per request.
//!
//! A function table is also available, for example
//! `{{ randomInt(1, 4) }}`, `{{ randomChoice("a", "b", "c") }}`,
//! `{{ randomUUID() }}`, `{{ randomLine("queries.txt") }}`,
//! `{{ readFile("body.json") }}` and `{{ printf("%s-%d", "id", 7) }}`.
//! File paths resolve relative to the working directory and file contents
//! are cached for the lifetime of the run.
//!
//! Parse failures abort the run before any request is emitted. Execution
//! failures never panic: the offending field renders as an empty string
//! and a warning is logged.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, RwLock};

use minijinja::value::{Rest, Value};
use minijinja::{context, Environment, ErrorKind};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use uuid::Uuid;

use crate::Error;

/// Template name for the target url.
pub(crate) const TEMPLATE_URL: &str = "url";
/// Template name for the request body.
pub(crate) const TEMPLATE_BODY: &str = "body";
/// Template name for the shell command.
pub(crate) const TEMPLATE_COMMAND: &str = "command";

/// Template name for the value of the nth configured header.
pub(crate) fn header_template_name(index: usize) -> String {
    format!("header:{}", index)
}

/// Rewrite the simple identity tokens to dotted references so template
/// execution sees a struct-shaped input.
pub(crate) fn preprocess(input: &str) -> String {
    input
        .replace("{{userID}}", "{{ user.id }}")
        .replace("{{requestID}}", "{{ request.id }}")
        .replace("{{uuid}}", "{{ request.id }}")
}

/// Resolve the `@file` body indirection: a body starting with a literal `@`
/// loads the rest of the string as a file through the cached `readFile`
/// helper.
pub(crate) fn body_source(body: &str) -> String {
    match body.strip_prefix('@') {
        Some(path) => format!("{{{{ readFile({:?}) }}}}", path),
        None => body.to_string(),
    }
}

/// One lazily loaded, forever cached file.
struct CachedFile {
    /// The entire file, as handed to `readFile`.
    contents: String,
    /// Trimmed, non-empty lines, as sampled by `randomLine`.
    lines: Vec<String>,
}

/// Memoized file loader shared by all template executions.
///
/// Population uses a read-then-write upgrade with a double check, so
/// concurrent first requests for the same file read it only once.
struct FileCache {
    files: RwLock<HashMap<String, Arc<CachedFile>>>,
}

impl FileCache {
    fn new() -> FileCache {
        FileCache {
            files: RwLock::new(HashMap::new()),
        }
    }

    fn get(&self, path: &str) -> io::Result<Arc<CachedFile>> {
        {
            let files = self.files.read().expect("file cache lock poisoned");
            if let Some(file) = files.get(path) {
                return Ok(file.clone());
            }
        }

        let mut files = self.files.write().expect("file cache lock poisoned");
        // Another task may have populated the entry while we waited for
        // the write lock.
        if let Some(file) = files.get(path) {
            return Ok(file.clone());
        }

        debug!("loading template file: {}", path);
        let contents = std::fs::read_to_string(path)?;
        let lines = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        let file = Arc::new(CachedFile { contents, lines });
        files.insert(path.to_string(), file.clone());
        Ok(file)
    }
}

/// Parsed templates for every dynamic field of a configuration, reusable
/// across requests.
pub struct TemplateEngine {
    environment: Environment<'static>,
}

impl TemplateEngine {
    /// Build an engine seeded from entropy.
    pub fn new() -> TemplateEngine {
        TemplateEngine::with_rng(StdRng::from_entropy())
    }

    /// Build an engine around an injected PRNG. Tests pass a seeded
    /// instance for deterministic output.
    pub fn with_rng(rng: StdRng) -> TemplateEngine {
        let mut environment = Environment::new();
        let prng = Arc::new(Mutex::new(rng));
        let file_cache = Arc::new(FileCache::new());

        let rng = prng.clone();
        environment.add_function(
            "randomInt",
            move |lo: i64, hi: i64| -> Result<i64, minijinja::Error> {
                // Half-open [lo, hi).
                if hi <= lo {
                    return Err(minijinja::Error::new(
                        ErrorKind::InvalidOperation,
                        format!("randomInt: upper bound {} must be greater than lower bound {}", hi, lo),
                    ));
                }
                let mut rng = rng.lock().expect("template prng mutex poisoned");
                Ok(rng.gen_range(lo..hi))
            },
        );

        let rng = prng.clone();
        environment.add_function("randomChoice", move |choices: Rest<Value>| -> Value {
            if choices.is_empty() {
                return Value::from("");
            }
            let mut rng = rng.lock().expect("template prng mutex poisoned");
            let index = rng.gen_range(0..choices.len());
            choices[index].clone()
        });

        environment.add_function("randomUUID", || Uuid::new_v4().to_string());
        environment.add_function("uuid", || Uuid::new_v4().to_string());

        let rng = prng.clone();
        let cache = file_cache.clone();
        environment.add_function(
            "randomLine",
            move |path: String| -> Result<String, minijinja::Error> {
                let file = cache.get(&path).map_err(|e| {
                    minijinja::Error::new(
                        ErrorKind::InvalidOperation,
                        format!("randomLine: failed to read '{}': {}", path, e),
                    )
                })?;
                if file.lines.is_empty() {
                    return Ok(String::new());
                }
                let mut rng = rng.lock().expect("template prng mutex poisoned");
                Ok(file.lines[rng.gen_range(0..file.lines.len())].clone())
            },
        );

        let cache = file_cache;
        environment.add_function(
            "readFile",
            move |path: String| -> Result<String, minijinja::Error> {
                let file = cache.get(&path).map_err(|e| {
                    minijinja::Error::new(
                        ErrorKind::InvalidOperation,
                        format!("readFile: failed to read '{}': {}", path, e),
                    )
                })?;
                Ok(file.contents.clone())
            },
        );

        environment.add_function(
            "printf",
            move |format: String, args: Rest<Value>| -> Result<String, minijinja::Error> {
                sprintf(&format, &args)
            },
        );

        TemplateEngine { environment }
    }

    /// Preprocess and parse one template, registering it under `name`.
    ///
    /// Parse failures are configuration faults and abort the run.
    pub fn add_template(&mut self, name: &str, source: &str) -> Result<(), Error> {
        let prepared = preprocess(source);
        self.environment
            .add_template_owned(name.to_string(), prepared)
            .map_err(|e| Error::InvalidTemplate {
                field: name.to_string(),
                detail: e.to_string(),
            })
    }

    /// Execute a previously parsed template with the given identities.
    ///
    /// Never panics: any execution failure degrades to an empty string so
    /// a bad template function can't take down a running load test.
    pub fn render(&self, name: &str, user_id: &str, request_id: &str) -> String {
        let template = match self.environment.get_template(name) {
            Ok(template) => template,
            Err(e) => {
                warn!("template '{}' is not registered: {}", name, e);
                return String::new();
            }
        };
        match template.render(context! {
            user => context! { id => user_id },
            request => context! { id => request_id },
        }) {
            Ok(rendered) => rendered,
            Err(e) => {
                warn!("failed to render template '{}': {}", name, e);
                String::new()
            }
        }
    }
}

impl Default for TemplateEngine {
    fn default() -> Self {
        TemplateEngine::new()
    }
}

/// A small printf: supports `%s`, `%d`, `%f`, `%x` and the `%%` escape.
fn sprintf(format: &str, args: &[Value]) -> Result<String, minijinja::Error> {
    let mut out = String::with_capacity(format.len());
    let mut chars = format.chars();
    let mut next_arg = 0;

    let take = |next_arg: &mut usize| -> Result<Value, minijinja::Error> {
        let value = args.get(*next_arg).cloned().ok_or_else(|| {
            minijinja::Error::new(
                ErrorKind::InvalidOperation,
                format!("printf: missing argument {} for format '{}'", *next_arg + 1, format),
            )
        })?;
        *next_arg += 1;
        Ok(value)
    };

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some('s') => out.push_str(&take(&mut next_arg)?.to_string()),
            Some('d') => {
                let value = take(&mut next_arg)?;
                let number = i64::try_from(value.clone()).map_err(|_| {
                    minijinja::Error::new(
                        ErrorKind::InvalidOperation,
                        format!("printf: %d expects an integer, got {}", value),
                    )
                })?;
                out.push_str(&number.to_string());
            }
            Some('f') => {
                let value = take(&mut next_arg)?;
                let number = f64::try_from(value.clone()).map_err(|_| {
                    minijinja::Error::new(
                        ErrorKind::InvalidOperation,
                        format!("printf: %f expects a number, got {}", value),
                    )
                })?;
                out.push_str(&format!("{}", number));
            }
            Some('x') => {
                let value = take(&mut next_arg)?;
                let number = i64::try_from(value.clone()).map_err(|_| {
                    minijinja::Error::new(
                        ErrorKind::InvalidOperation,
                        format!("printf: %x expects an integer, got {}", value),
                    )
                })?;
                out.push_str(&format!("{:x}", number));
            }
            Some(other) => {
                return Err(minijinja::Error::new(
                    ErrorKind::InvalidOperation,
                    format!("printf: unsupported verb '%{}'", other),
                ));
            }
            None => {
                return Err(minijinja::Error::new(
                    ErrorKind::InvalidOperation,
                    "printf: dangling '%' at end of format".to_string(),
                ));
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::io::Write;

    fn seeded_engine() -> TemplateEngine {
        TemplateEngine::with_rng(StdRng::seed_from_u64(42))
    }

    #[test]
    fn identity_tokens_are_rewritten() {
        assert_eq!(preprocess("{{userID}}"), "{{ user.id }}");
        assert_eq!(preprocess("{{requestID}}"), "{{ request.id }}");
        assert_eq!(preprocess("{{uuid}}"), "{{ request.id }}");
        assert_eq!(
            preprocess("a={{userID}}&b={{requestID}}"),
            "a={{ user.id }}&b={{ request.id }}"
        );
        assert_eq!(preprocess("no tokens"), "no tokens");
    }

    #[test]
    fn body_file_indirection() {
        assert_eq!(body_source("@payload.json"), "{{ readFile(\"payload.json\") }}");
        assert_eq!(body_source("plain body"), "plain body");
        // Only a leading @ triggers the rewrite.
        assert_eq!(body_source("user@example.com"), "user@example.com");
    }

    #[test]
    fn static_templates_are_deterministic() {
        let mut engine = seeded_engine();
        engine
            .add_template("url", "http://example.com/{{userID}}?r={{requestID}}")
            .unwrap();
        let first = engine.render("url", "user-a", "req-1");
        assert_eq!(first, "http://example.com/user-a?r=req-1");
        for _ in 0..10 {
            assert_eq!(engine.render("url", "user-a", "req-1"), first);
        }
    }

    #[test]
    fn random_int_is_half_open() {
        let mut engine = seeded_engine();
        engine.add_template("body", "{{ randomInt(1, 4) }}").unwrap();
        let mut seen = HashSet::new();
        for _ in 0..200 {
            let value: i64 = engine.render("body", "u", "r").parse().unwrap();
            assert!((1..4).contains(&value), "randomInt(1, 4) produced {}", value);
            seen.insert(value);
        }
        // With 200 draws all three values show up with overwhelming probability.
        assert_eq!(seen, HashSet::from([1, 2, 3]));
    }

    #[test]
    fn random_int_rejects_empty_range() {
        let mut engine = seeded_engine();
        engine.add_template("body", "{{ randomInt(4, 4) }}").unwrap();
        // Execution failure degrades to an empty string rather than a panic.
        assert_eq!(engine.render("body", "u", "r"), "");

        engine.add_template("body2", "{{ randomInt(5, 1) }}").unwrap();
        assert_eq!(engine.render("body2", "u", "r"), "");
    }

    #[test]
    fn random_choice_picks_an_argument() {
        let mut engine = seeded_engine();
        engine
            .add_template("body", "{{ randomChoice(\"a\", \"b\", \"c\") }}")
            .unwrap();
        let mut seen = HashSet::new();
        for _ in 0..100 {
            let choice = engine.render("body", "u", "r");
            assert!(["a", "b", "c"].contains(&choice.as_str()));
            seen.insert(choice);
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn uuid_format() {
        let mut engine = seeded_engine();
        engine.add_template("a", "{{ randomUUID() }}").unwrap();
        engine.add_template("b", "{{ uuid() }}").unwrap();
        for name in ["a", "b"] {
            let rendered = engine.render(name, "u", "r");
            assert_eq!(rendered.len(), 36);
            assert_eq!(rendered.matches('-').count(), 4);
        }
        // Fresh per invocation.
        assert_ne!(engine.render("a", "u", "r"), engine.render("a", "u", "r"));
    }

    #[test]
    fn random_line_samples_the_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "alpha\n\n  beta  \ngamma").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let mut engine = seeded_engine();
        engine
            .add_template("body", &format!("{{{{ randomLine({:?}) }}}}", path))
            .unwrap();
        let mut seen = HashSet::new();
        for _ in 0..100 {
            let line = engine.render("body", "u", "r");
            assert!(["alpha", "beta", "gamma"].contains(&line.as_str()));
            seen.insert(line);
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn files_are_read_once_and_cached_forever() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "cached").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let mut engine = seeded_engine();
        engine
            .add_template("body", &format!("{{{{ randomLine({:?}) }}}}", path))
            .unwrap();
        assert_eq!(engine.render("body", "u", "r"), "cached");

        // Delete the file; a second render must come from the cache.
        file.close().unwrap();
        assert_eq!(engine.render("body", "u", "r"), "cached");
    }

    #[test]
    fn missing_file_degrades_to_empty() {
        let mut engine = seeded_engine();
        engine
            .add_template("body", "{{ randomLine(\"/no/such/file\") }}")
            .unwrap();
        assert_eq!(engine.render("body", "u", "r"), "");
    }

    #[test]
    fn read_file_returns_whole_contents() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "line one\nline two\n").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let mut engine = seeded_engine();
        engine
            .add_template("body", &body_source(&format!("@{}", path)))
            .unwrap();
        assert_eq!(engine.render("body", "u", "r"), "line one\nline two\n");
    }

    #[test]
    fn parse_failures_are_configuration_faults() {
        let mut engine = seeded_engine();
        let result = engine.add_template("url", "{{ unterminated");
        match result {
            Err(Error::InvalidTemplate { field, .. }) => assert_eq!(field, "url"),
            other => panic!("expected InvalidTemplate, got {:?}", other.err()),
        }
    }

    #[test]
    fn printf_verbs() {
        assert_eq!(
            sprintf("%s-%d", &[Value::from("id"), Value::from(7)]).unwrap(),
            "id-7"
        );
        assert_eq!(sprintf("%d%%", &[Value::from(99)]).unwrap(), "99%");
        assert_eq!(sprintf("%x", &[Value::from(255)]).unwrap(), "ff");
        assert_eq!(sprintf("%f", &[Value::from(1.5)]).unwrap(), "1.5");
        assert!(sprintf("%s", &[]).is_err());
        assert!(sprintf("%q", &[Value::from(1)]).is_err());
        assert!(sprintf("trailing %", &[]).is_err());
    }

    #[test]
    fn seeded_engines_agree() {
        let mut first = seeded_engine();
        let mut second = seeded_engine();
        for engine in [&mut first, &mut second] {
            engine
                .add_template("body", "{{ randomInt(0, 1000000) }}")
                .unwrap();
        }
        for _ in 0..20 {
            assert_eq!(
                first.render("body", "u", "r"),
                second.render("body", "u", "r")
            );
        }
    }
}
