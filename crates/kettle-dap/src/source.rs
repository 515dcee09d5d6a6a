//! Mapping Java source files to the class names jdb understands.

use std::path::Path;

/// Extract the package name from the header of a Java compilation unit.
///
/// Only the part of the file before the first type declaration is examined; comments are
/// skipped. Returns `None` for the default package.
pub fn parse_package_declaration(text: &str) -> Option<String> {
    let mut rest = text;
    loop {
        rest = rest.trim_start();
        if let Some(after) = rest.strip_prefix("//") {
            rest = after.split_once('\n').map_or("", |(_, tail)| tail);
            continue;
        }
        if let Some(after) = rest.strip_prefix("/*") {
            rest = after.split_once("*/").map_or("", |(_, tail)| tail);
            continue;
        }
        // Package annotations (`@Deprecated package a.b;` in package-info.java).
        if rest.starts_with('@') {
            let end = rest
                .find(|c: char| c.is_whitespace() || c == '(')
                .unwrap_or(rest.len());
            rest = &rest[end..];
            if let Some(args) = rest.trim_start().strip_prefix('(') {
                rest = args.split_once(')').map_or("", |(_, tail)| tail);
            }
            continue;
        }
        break;
    }

    let after = rest.strip_prefix("package")?;
    if !after.starts_with(|c: char| c.is_whitespace() || c == '/') {
        return None;
    }
    let (name, _) = after.split_once(';')?;
    let name: String = strip_comments(name).chars().filter(|c| !c.is_whitespace()).collect();
    let valid = !name.is_empty()
        && name
            .split('.')
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '$'));
    valid.then_some(name)
}

fn strip_comments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    loop {
        let line = rest.find("//");
        let block = rest.find("/*");
        match (line, block) {
            (Some(l), b) if b.map_or(true, |b| l < b) => {
                out.push_str(&rest[..l]);
                rest = rest[l..].split_once('\n').map_or("", |(_, tail)| tail);
            }
            (_, Some(b)) => {
                out.push_str(&rest[..b]);
                rest = rest[b + 2..].split_once("*/").map_or("", |(_, tail)| tail);
            }
            _ => {
                out.push_str(rest);
                return out;
            }
        }
    }
}

/// The file's base name without its extension, e.g. `Foo` for `src/a/Foo.java`.
pub fn base_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// The jdb class name for a source file: `package.BaseName`, or `BaseName` when the contents
/// are unavailable or declare no package.
pub fn resolve_unit_name(path: &Path, contents: Option<&str>) -> String {
    let base = base_name(path);
    match contents.and_then(parse_package_declaration) {
        Some(package) => format!("{package}.{base}"),
        None => base,
    }
}
