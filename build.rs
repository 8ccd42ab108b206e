use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Directories whose Rust sources are checked.
const SCANNED_ROOTS: &[&str] = &["src", "tests"];

const MARKER_WORDS: &[&str] = &[
    "CRITICAL",
    "FIX",
    "FIXED",
    "NEW",
    "CHANGE",
    "CHANGED",
    "UPDATE",
    "UPDATED",
    "MODIFIED",
    "IMPORTANT",
];

// A line-level check. The regex is a cheap prefilter for the searcher; the
// predicate then looks at the line split into code and comment.
struct Rule {
    name: &'static str,
    pattern: &'static str,
    violates: fn(&SplitLine) -> bool,
    hint: &'static str,
}

// A source line with string literal contents blanked out and the trailing
// `//` comment separated from the code.
struct SplitLine {
    code: String,
    comment: Option<String>,
}

impl SplitLine {
    fn parse(line: &str) -> Self {
        let mut code = String::with_capacity(line.len());
        let mut chars = line.char_indices().peekable();
        let mut in_string = false;
        while let Some((i, c)) = chars.next() {
            if in_string {
                match c {
                    '\\' => {
                        chars.next();
                    }
                    '"' => {
                        in_string = false;
                        code.push('"');
                    }
                    _ => code.push(' '),
                }
                continue;
            }
            match c {
                '"' => {
                    in_string = true;
                    code.push('"');
                }
                '/' if chars.peek().is_some_and(|&(_, n)| n == '/') => {
                    return Self {
                        code,
                        comment: Some(line[i + 2..].trim_start_matches(['/', '!']).to_string()),
                    };
                }
                _ => code.push(c),
            }
        }
        Self {
            code,
            comment: None,
        }
    }
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

// True when `text` contains an identifier starting with `_` such as `_x`.
fn has_underscore_prefixed_ident(text: &str) -> bool {
    let bytes = text.as_bytes();
    (0..bytes.len()).any(|i| {
        bytes[i] == b'_'
            && (i == 0 || !is_word_byte(bytes[i - 1]))
            && bytes.get(i + 1).is_some_and(|&b| is_word_byte(b))
    })
}

// True when a `let (...) =` pattern discards one of its components with `_`.
fn tuple_pattern_discards(code: &str) -> bool {
    let Some(start) = code.find("let (") else {
        return false;
    };
    let rest = &code[start + 4..];
    let mut depth = 0usize;
    let mut component = String::new();
    for c in rest.chars() {
        match c {
            '(' => {
                depth += 1;
                if depth > 1 {
                    component.push(c);
                }
            }
            ')' => {
                if depth == 1 {
                    return component.trim() == "_";
                }
                depth = depth.saturating_sub(1);
                component.push(c);
            }
            ',' if depth == 1 => {
                if component.trim() == "_" {
                    return true;
                }
                component.clear();
            }
            _ => component.push(c),
        }
    }
    false
}

fn has_marker_word(comment: &str) -> bool {
    comment
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|word| MARKER_WORDS.contains(&word))
}

fn is_shouting(comment: &str) -> bool {
    let letters: Vec<char> = comment.chars().filter(|c| c.is_alphabetic()).collect();
    let upper = letters.iter().filter(|c| c.is_uppercase()).count();
    letters.len() >= 8 && upper * 5 > letters.len() * 4
}

fn is_dash_rule(comment: &str) -> bool {
    let visible: Vec<char> = comment.chars().filter(|c| !c.is_whitespace()).collect();
    let dashes = visible.iter().filter(|&&c| c == '-' || c == '=').count();
    visible.len() >= 5 && dashes * 5 > visible.len() * 4
}

fn has_empty_control_block(code: &str) -> bool {
    let compact: String = code.split_whitespace().collect::<Vec<_>>().join(" ");
    if !compact.contains("{}") && !compact.contains("{ }") {
        return false;
    }
    let head = compact.split('{').next().unwrap_or("");
    ["if ", "else", "for ", "while ", "loop", "match "]
        .iter()
        .any(|kw| head.trim_start().starts_with(kw) || head.contains(&format!("}} {kw}")))
}

const RULES: &[Rule] = &[
    Rule {
        name: "underscore-prefixed identifier",
        pattern: r"\b_[A-Za-z0-9]",
        violates: |line| has_underscore_prefixed_ident(&line.code),
        hint: "Use the binding, or match it with a bare `_`.",
    },
    Rule {
        name: "discarded let binding",
        pattern: r"let\s+_\s*=",
        violates: |line| line.code.contains("let _"),
        hint: "Handle the value instead of discarding it.",
    },
    Rule {
        name: "tuple component discarded",
        pattern: r"let\s*\(",
        violates: |line| tuple_pattern_discards(&line.code),
        hint: "Bind every component of the tuple, or index the fields you need.",
    },
    Rule {
        name: "marker word in comment",
        pattern: r"//",
        violates: |line| line.comment.as_deref().is_some_and(has_marker_word),
        hint: "Comments describe the code, not its history.",
    },
    Rule {
        name: "bold markup in comment",
        pattern: r"//.*\*\*",
        violates: |line| line.comment.as_deref().is_some_and(|c| c.contains("**")),
        hint: "Keep comments plain text.",
    },
    Rule {
        name: "uppercase or rule-line comment",
        pattern: r"//",
        violates: |line| {
            line.comment
                .as_deref()
                .is_some_and(|c| is_shouting(c) || is_dash_rule(c))
        },
        hint: "Write comments as sentences.",
    },
    Rule {
        name: "allow(dead_code)",
        pattern: r"#\s*!?\[\s*allow\s*\(\s*dead_code",
        violates: |line| line.code.contains("dead_code"),
        hint: "Delete unused code instead of silencing the lint.",
    },
    Rule {
        name: "ignored test",
        pattern: r"#\s*\[\s*ignore",
        violates: |line| line.code.contains("ignore"),
        hint: "Fix or delete the test.",
    },
    Rule {
        name: "debug_assert",
        pattern: r"debug_assert",
        violates: |line| line.code.contains("debug_assert"),
        hint: "Use assert! so the check also runs in release builds.",
    },
    Rule {
        name: "explicit drop",
        pattern: r"\bdrop\s*\(",
        violates: |line| line.code.contains("drop("),
        hint: "Scope the value instead.",
    },
    Rule {
        name: "empty control-flow block",
        pattern: r"\{\s*\}",
        violates: |line| has_empty_control_block(&line.code),
        hint: "Remove the branch or give it a body.",
    },
];

struct RuleCollector<'r> {
    rule: &'r Rule,
    hits: Vec<String>,
}

impl Sink for RuleCollector<'_> {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if (self.rule.violates)(&SplitLine::parse(text)) {
            let line_number = mat.line_number().unwrap_or(0);
            self.hits.push(format!("{line_number}:{text}"));
        }
        Ok(true)
    }
}

fn rust_sources(root: &Path) -> Vec<PathBuf> {
    SCANNED_ROOTS
        .iter()
        .map(|dir| root.join(dir))
        .filter(|dir| dir.is_dir())
        .flat_map(|dir| {
            WalkDir::new(dir)
                .into_iter()
                .filter_map(Result::ok)
                .filter(|e| e.file_type().is_file())
                .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
                .map(|e| e.into_path())
        })
        .collect()
}

fn check_file(path: &Path, searcher: &mut Searcher) -> Vec<String> {
    let mut report = Vec::new();
    for rule in RULES {
        let matcher = match RegexMatcher::new_line_matcher(rule.pattern) {
            Ok(matcher) => matcher,
            Err(e) => {
                report.push(format!("invalid pattern for rule `{}`: {e}", rule.name));
                continue;
            }
        };
        let mut collector = RuleCollector {
            rule,
            hits: Vec::new(),
        };
        if let Err(e) = searcher.search_path(&matcher, path, &mut collector) {
            report.push(format!("{}: could not be searched: {e}", path.display()));
            continue;
        }
        if !collector.hits.is_empty() {
            let mut message = format!("{} in {}:\n", rule.name, path.display());
            for hit in &collector.hits {
                message.push_str(&format!("   {hit}\n"));
            }
            message.push_str(&format!("   {}\n", rule.hint));
            report.push(message);
        }
    }
    report
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in SCANNED_ROOTS {
        println!("cargo:rerun-if-changed={dir}");
    }
    println!("cargo:rerun-if-env-changed=WOLFE_LBFGS_SKIP_LINT_CHECKS");

    if std::env::var_os("WOLFE_LBFGS_SKIP_LINT_CHECKS").is_some()
        || std::env::var_os("DOCS_RS").is_some()
    {
        return;
    }

    let root = std::env::var_os("CARGO_MANIFEST_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let mut searcher = Searcher::new();
    let violations: Vec<String> = rust_sources(&root)
        .iter()
        .flat_map(|path| check_file(path, &mut searcher))
        .collect();

    if !violations.is_empty() {
        eprintln!("\nsource checks failed:\n");
        for violation in &violations {
            eprintln!("{violation}");
        }
        eprintln!("{} violation groups found.", violations.len());
        std::process::exit(1);
    }
}
