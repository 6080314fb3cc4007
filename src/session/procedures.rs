//! Infers the enclosing procedure for call-stack frames.
//!
//! The debuggee reports history entries as bare locations plus a name of
//! uneven quality, so frame names are recovered from the source itself: a
//! scan pairs `Procedure`/`EndProcedure` and tracks `Module` nesting, and
//! the ranges are cached per source path.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

/// A procedure's line range in one source file. Lines are 0-based, both
/// ends inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ProcedureRange {
    pub(crate) start_line: u32,
    pub(crate) end_line: u32,
    /// Display name, already qualified and parenthesised: `Foo()` or
    /// `Module::Foo()`.
    pub(crate) name: String,
}

/// Per-source cache of procedure ranges.
pub(crate) struct ProcedureIndex {
    workspace: Option<PathBuf>,
    cache: HashMap<PathBuf, Vec<ProcedureRange>>,
}

impl ProcedureIndex {
    /// Creates an index rooted at the workspace directory. Sources outside
    /// it are never scanned.
    pub(crate) fn new(workspace: Option<PathBuf>) -> Self {
        Self {
            workspace,
            cache: HashMap::new(),
        }
    }

    /// Name of the procedure enclosing `line` (0-based) in `path`, if any.
    pub(crate) fn lookup(&mut self, path: &Path, line: u32) -> Option<String> {
        if let Some(workspace) = &self.workspace {
            if !path.starts_with(workspace) {
                return None;
            }
        }

        if !self.cache.contains_key(path) {
            let ranges = match fs::read_to_string(path) {
                Ok(source) => scan(&source),
                Err(err) => {
                    log::debug!("cannot index {}: {err}", path.display());
                    Vec::new()
                }
            };
            self.cache.insert(path.to_path_buf(), ranges);
        }

        self.cache[path]
            .iter()
            .find(|range| range.start_line <= line && line <= range.end_line)
            .map(|range| range.name.clone())
    }
}

fn scan(source: &str) -> Vec<ProcedureRange> {
    let mut ranges = Vec::new();
    let mut modules: Vec<String> = Vec::new();
    let mut open: Vec<(u32, String)> = Vec::new();

    for (line_no, raw_line) in source.lines().enumerate() {
        let line_no = line_no as u32;
        let line = strip_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        let mut words = line.split_whitespace();
        let Some(keyword) = words.next() else { continue };

        if keyword.eq_ignore_ascii_case("Module") {
            if let Some(name) = words.next() {
                modules.push(name.to_string());
            }
        } else if keyword.eq_ignore_ascii_case("EndModule") {
            modules.pop();
        } else if keyword.eq_ignore_ascii_case("EndProcedure") {
            if let Some((start_line, name)) = open.pop() {
                ranges.push(ProcedureRange {
                    start_line,
                    end_line: line_no,
                    name,
                });
            }
        } else if is_procedure_keyword(keyword) {
            if let Some(name) = words.next().and_then(procedure_name) {
                let name = qualify(&name, modules.last());
                open.push((line_no, name));
            }
        }
    }

    // An unclosed procedure runs to the end of the file.
    let eof = source.lines().count().saturating_sub(1) as u32;
    for (start_line, name) in open {
        ranges.push(ProcedureRange {
            start_line,
            end_line: eof,
            name,
        });
    }

    ranges
}

// Matches Procedure, ProcedureC, ProcedureDLL and ProcedureCDLL, each with
// an optional `.type` return suffix. ProcedureReturn must not match.
fn is_procedure_keyword(word: &str) -> bool {
    let base = word.split('.').next().unwrap_or(word);
    let Some(suffix) = base
        .get(..9)
        .filter(|p| p.eq_ignore_ascii_case("Procedure"))
        .map(|_| &base[9..])
    else {
        return false;
    };

    suffix.is_empty()
        || suffix.eq_ignore_ascii_case("C")
        || suffix.eq_ignore_ascii_case("DLL")
        || suffix.eq_ignore_ascii_case("CDLL")
}

fn procedure_name(word: &str) -> Option<String> {
    let name: String = word
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == ':')
        .collect();

    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

fn qualify(name: &str, module: Option<&String>) -> String {
    match module {
        Some(module) if !name.contains("::") => format!("{module}::{name}()"),
        _ => format!("{name}()"),
    }
}

// Cuts a trailing `;` comment, ignoring semicolons inside string literals.
fn strip_comment(line: &str) -> &str {
    let mut in_string = false;
    for (i, c) in line.char_indices() {
        match c {
            '"' => in_string = !in_string,
            ';' if !in_string => return &line[..i],
            _ => {}
        }
    }

    line
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn plain_procedure() {
        let source = "x = 1\nProcedure Foo(a, b)\n  Debug a\nEndProcedure\ny = 2\n";
        let ranges = scan(source);

        assert_eq!(
            ranges,
            vec![ProcedureRange {
                start_line: 1,
                end_line: 3,
                name: "Foo()".to_string(),
            }]
        );
    }

    #[test]
    fn typed_and_variant_keywords() {
        let source = "\
Procedure.i Count()
EndProcedure
ProcedureDLL Export()
EndProcedure
ProcedureC.d Callback(x.d)
EndProcedure
";
        let names: Vec<_> = scan(source).into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["Count()", "Export()", "Callback()"]);
    }

    #[test]
    fn procedure_return_is_not_a_procedure() {
        let source = "Procedure Foo()\n  ProcedureReturn 1\nEndProcedure\n";
        let ranges = scan(source);

        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].end_line, 2);
    }

    #[test]
    fn module_qualifies_names() {
        let source = "\
Module M
  Procedure Foo()
    Debug 1
  EndProcedure
EndModule
Procedure Bare()
EndProcedure
";
        let names: Vec<_> = scan(source).into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["M::Foo()", "Bare()"]);
    }

    #[test]
    fn trailing_comments_and_strings() {
        let source = "Procedure Foo() ; opens here\n  s$ = \"semi;colon\"\nEndProcedure\n";
        let ranges = scan(source);

        assert_eq!(ranges[0].name, "Foo()");
        assert_eq!(ranges[0].end_line, 2);
    }

    #[test]
    fn unclosed_procedure_extends_to_eof() {
        let source = "Procedure Foo()\n  Debug 1\n  Debug 2\n";
        let ranges = scan(source);

        assert_eq!(ranges[0].end_line, 2);
    }

    #[test]
    fn lookup_uses_cache_and_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("main.pb");
        std::fs::write(&path, "Procedure Foo()\n  Debug 1\nEndProcedure\n").unwrap();

        let mut index = ProcedureIndex::new(Some(dir.path().to_path_buf()));
        assert_eq!(index.lookup(&path, 1), Some("Foo()".to_string()));
        assert_eq!(index.lookup(&path, 2), Some("Foo()".to_string()));

        // Outside the workspace: never scanned.
        let mut index = ProcedureIndex::new(Some(PathBuf::from("/nonexistent")));
        assert_eq!(index.lookup(&path, 1), None);
    }
}
