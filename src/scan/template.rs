use once_cell::sync::Lazy;
use regex::Regex;

use crate::prelude::{StrictPath, CASE_INSENSITIVE_OS};

pub mod placeholder {
    pub const PATH_TO_GAME: &str = "<path-to-game>";
    pub const STEAM_FOLDER: &str = "<steam-folder>";
    pub const STEAM_LIBRARY_FOLDER: &str = "<steamlibrary-folder>";
    pub const GAME: &str = "<game>";
    pub const SOFTWARE_NAME: &str = "<the name of the software>";
    pub const USER_ID: &str = "<user-id>";
}

/// Cartesian expansion can explode on pathological rules; bound it.
const MAX_TEMPLATES: usize = 64;
const MAX_USER_ID_DIRS: usize = 100;
const MAX_WILDCARD_RESULTS: usize = 200;

static RE_WIKI_TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\{\{p\|([^}]+)\}\}").unwrap());
static RE_ENV_VAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"%([^%\s]+)%").unwrap());

const REGISTRY_PREFIXES: &[&str] = &[
    "HKCU\\",
    "HKLM\\",
    "HKU\\",
    "HKCR\\",
    "HKEY_CURRENT_USER\\",
    "HKEY_LOCAL_MACHINE\\",
    "HKEY_USERS\\",
    "HKEY_CLASSES_ROOT\\",
];

fn starts_marker(text: &str) -> bool {
    let bytes = text.as_bytes();

    if text.starts_with("{{") {
        return true;
    }
    // `<token>` style placeholders.
    if bytes.len() >= 2 && bytes[0] == b'<' && bytes[1].is_ascii_alphabetic() {
        return true;
    }
    // `%ENVVAR%` with a closing percent sign.
    if bytes.len() >= 2 && bytes[0] == b'%' && bytes[1].is_ascii_alphanumeric() && text[1..].contains('%') {
        return true;
    }
    // Registry roots.
    if REGISTRY_PREFIXES
        .iter()
        .any(|prefix| bytes.len() >= prefix.len() && bytes[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes()))
    {
        return true;
    }
    // Drive letters like `X:\`.
    if bytes.len() >= 3 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' && (bytes[2] == b'\\' || bytes[2] == b'/') {
        return true;
    }

    false
}

fn is_boundary(previous: Option<char>) -> bool {
    match previous {
        None => true,
        Some(c) => c.is_whitespace() || c == ',' || c == ';',
    }
}

/// Splits a composite location string into independent rules. Start markers
/// (`<token>`, `%ENVVAR%`, registry roots, drive letters) at word
/// boundaries begin a new segment; without markers, `;` and newlines are
/// the separators.
pub fn split_composite_rule(location: &str) -> Vec<String> {
    let trimmed = location.trim();
    if trimmed.is_empty() {
        return vec![];
    }

    let mut marker_offsets = vec![];
    let mut previous = None;
    for (offset, c) in trimmed.char_indices() {
        if is_boundary(previous) && starts_marker(&trimmed[offset..]) {
            marker_offsets.push(offset);
        }
        previous = Some(c);
    }

    if marker_offsets.len() >= 2 {
        let mut segments = vec![];
        for (i, start) in marker_offsets.iter().enumerate() {
            let end = marker_offsets.get(i + 1).copied().unwrap_or(trimmed.len());
            let segment = trimmed[*start..end].trim_matches([' ', '\t', ',', ';']);
            if !segment.is_empty() {
                segments.push(segment.to_string());
            }
        }
        return segments;
    }

    trimmed
        .split([';', '\n'])
        .map(|segment| segment.trim().to_string())
        .filter(|segment| !segment.is_empty())
        .collect()
}

/// Maps wiki-style `{{p|...}}` tokens onto `%ENVVAR%` form, with a few
/// special cases that become placeholders of their own.
pub fn map_wiki_tokens(template: &str) -> String {
    RE_WIKI_TOKEN
        .replace_all(template, |caps: &regex::Captures| {
            let inner = caps[1].trim();
            let (name, rest) = match inner.find(['\\', '/']) {
                Some(split) => (&inner[..split], &inner[split..]),
                None => (inner, ""),
            };
            let mapped = match name.to_lowercase().as_str() {
                "steam" => placeholder::STEAM_FOLDER.to_string(),
                "game" => placeholder::PATH_TO_GAME.to_string(),
                "uid" => placeholder::USER_ID.to_string(),
                "hkcu" => "HKCU".to_string(),
                "hklm" => "HKLM".to_string(),
                other => format!("%{}%", other.to_uppercase()),
            };
            format!("{mapped}{rest}")
        })
        .to_string()
}

/// What the placeholders stand for during one detection run.
#[derive(Clone, Debug, Default)]
pub struct TemplateContext {
    pub install_path: Option<StrictPath>,
    pub install_dir_name: Option<String>,
    pub game_name: String,
    pub steam_roots: Vec<StrictPath>,
    pub steam_libraries: Vec<StrictPath>,
}

fn substitute(templates: Vec<String>, token: &str, replacements: &[String]) -> Vec<String> {
    let mut output = vec![];
    for template in templates {
        if !template.contains(token) {
            output.push(template);
            continue;
        }
        for replacement in replacements {
            if output.len() >= MAX_TEMPLATES {
                log::warn!("template expansion truncated at {MAX_TEMPLATES} variants");
                return output;
            }
            output.push(template.replace(token, replacement));
        }
    }
    output
}

/// Token replacement is Cartesian over replacement sets: N replacements
/// produce N templates. Templates whose tokens have no replacement at all
/// are dropped.
pub fn expand_placeholders(template: &str, context: &TemplateContext) -> Vec<String> {
    let install_path: Vec<String> = context.install_path.iter().map(|x| x.render()).collect();
    let steam_roots: Vec<String> = context.steam_roots.iter().map(|x| x.render()).collect();
    let steam_libraries: Vec<String> = context.steam_libraries.iter().map(|x| x.render()).collect();

    let mut names = vec![];
    if let Some(dir_name) = &context.install_dir_name {
        if !dir_name.is_empty() {
            names.push(dir_name.clone());
        }
    }
    if !context.game_name.is_empty() && !names.contains(&context.game_name) {
        names.push(context.game_name.clone());
    }

    let mut templates = vec![template.to_string()];
    templates = substitute(templates, placeholder::PATH_TO_GAME, &install_path);
    templates = substitute(templates, placeholder::STEAM_LIBRARY_FOLDER, &steam_libraries);
    templates = substitute(templates, placeholder::STEAM_FOLDER, &steam_roots);
    templates = substitute(templates, placeholder::GAME, &names);
    templates = substitute(templates, placeholder::SOFTWARE_NAME, &names);
    templates
}

fn lookup_env(name: &str) -> Option<String> {
    if let Ok(found) = std::env::var(name) {
        return Some(found);
    }
    if CASE_INSENSITIVE_OS {
        for (key, value) in std::env::vars() {
            if key.eq_ignore_ascii_case(name) {
                return Some(value);
            }
        }
    }
    None
}

/// Expands `%VAR%` via the environment. Unresolved variables are preserved
/// as-is so the path simply fails the existence check later.
pub fn expand_env(template: &str) -> String {
    RE_ENV_VAR
        .replace_all(template, |caps: &regex::Captures| {
            lookup_env(&caps[1]).unwrap_or_else(|| caps[0].to_string())
        })
        .to_string()
}

/// Expands `<user-id>` by enumerating immediate subdirectories of the path
/// prefix. When the prefix does not exist, the token degrades to `*` and
/// the wildcard pass takes over.
pub fn expand_user_id(template: &str) -> Vec<String> {
    let Some(token_at) = template.find(placeholder::USER_ID) else {
        return vec![template.to_string()];
    };

    let prefix = StrictPath::new(template[..token_at].to_string());
    if !prefix.is_dir() {
        return expand_user_id(&template.replacen(placeholder::USER_ID, "*", 1));
    }

    let Ok(entries) = std::fs::read_dir(prefix.interpret()) else {
        return expand_user_id(&template.replacen(placeholder::USER_ID, "*", 1));
    };

    let mut output = vec![];
    for entry in entries.flatten().take(MAX_USER_ID_DIRS) {
        if !entry.path().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        output.extend(expand_user_id(&template.replacen(placeholder::USER_ID, &name, 1)));
        if output.len() >= MAX_USER_ID_DIRS {
            break;
        }
    }
    output
}

fn segment_matcher(segment: &str) -> Option<globset::GlobMatcher> {
    globset::GlobBuilder::new(segment)
        .literal_separator(true)
        .case_insensitive(CASE_INSENSITIVE_OS)
        .build()
        .map(|glob| glob.compile_matcher())
        .map_err(|e| log::debug!("not a usable wildcard segment {segment:?}: {e}"))
        .ok()
}

/// Expands `*` and `?` by walking the path segment-by-segment, matching
/// directory entries case-insensitively on case-insensitive hosts.
pub fn expand_wildcards(template: &str) -> Vec<String> {
    if !template.contains(['*', '?']) {
        return vec![template.to_string()];
    }

    let rendered = template.replace('\\', "/");
    let (root, remainder) = if let Some(stripped) = rendered.strip_prefix('/') {
        ("/".to_string(), stripped.to_string())
    } else if rendered.len() >= 3 && rendered.as_bytes()[1] == b':' && rendered.as_bytes()[2] == b'/' {
        (rendered[..3].to_string(), rendered[3..].to_string())
    } else {
        return vec![template.to_string()];
    };

    let mut bases = vec![root.trim_end_matches('/').to_string()];
    let segments: Vec<&str> = remainder.split('/').filter(|x| !x.is_empty()).collect();

    for (index, segment) in segments.iter().enumerate() {
        let last = index == segments.len() - 1;

        if !segment.contains(['*', '?']) {
            bases = bases.into_iter().map(|base| format!("{base}/{segment}")).collect();
            continue;
        }

        let Some(matcher) = segment_matcher(segment) else {
            bases = bases.into_iter().map(|base| format!("{base}/{segment}")).collect();
            continue;
        };

        let mut matched = vec![];
        for base in &bases {
            let Ok(entries) = std::fs::read_dir(format!("{base}/")) else {
                continue;
            };
            for entry in entries.flatten() {
                if !last && !entry.path().is_dir() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().to_string();
                if matcher.is_match(&name) {
                    matched.push(format!("{base}/{name}"));
                }
                if matched.len() >= MAX_WILDCARD_RESULTS {
                    break;
                }
            }
        }
        bases = matched;
        if bases.is_empty() {
            return vec![];
        }
    }

    bases
}

/// Final cleanup: trim and strip one layer of outer quotes.
pub fn strip_quotes(path: &str) -> String {
    let trimmed = path.trim();
    for quote in ['"', '\''] {
        if trimmed.len() >= 2 && trimmed.starts_with(quote) && trimmed.ends_with(quote) {
            return trimmed[1..trimmed.len() - 1].to_string();
        }
    }
    trimmed.to_string()
}
