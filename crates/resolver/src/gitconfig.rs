//! Minimal git config file writer.

use std::fmt::Write as _;
use std::io;

/// Sections of `key = value` pairs, written in insertion order.
///
/// A section name containing a dot is written as a subsection, so
/// `url.https://x/` becomes `[url "https://x/"]`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GitConfig {
    sections: Vec<(String, Vec<(String, String)>)>,
}

impl GitConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a key to a section, creating the section if needed.
    pub fn add(&mut self, section: &str, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.sections.iter_mut().find(|(name, _)| name == section) {
            Some((_, pairs)) => pairs.push((key.to_string(), value)),
            None => self
                .sections
                .push((section.to_string(), vec![(key.to_string(), value)])),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// Render in git's config syntax.
    pub fn render(&self) -> io::Result<String> {
        let mut out = String::new();
        for (section, pairs) in &self.sections {
            write_section_name(&mut out, section)?;
            for (key, value) in pairs {
                write_key_value(&mut out, key, value)?;
            }
        }
        Ok(out)
    }
}

fn reject_nul(what: &str, s: &str) -> io::Result<()> {
    if s.contains('\0') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{what} contains a NUL byte"),
        ));
    }
    Ok(())
}

fn write_section_name(out: &mut String, section: &str) -> io::Result<()> {
    reject_nul("section name", section)?;
    match section.split_once('.') {
        Some((name, subsection)) => {
            let _ = write!(out, "[{name} \"");
            for c in subsection.chars() {
                if c == '"' || c == '\\' {
                    out.push('\\');
                }
                out.push(c);
            }
            out.push_str("\"]\n");
        }
        None => {
            let _ = writeln!(out, "[{section}]");
        }
    }
    Ok(())
}

fn write_key_value(out: &mut String, key: &str, value: &str) -> io::Result<()> {
    reject_nul("key", key)?;
    reject_nul("value", value)?;
    let quote = if value.starts_with(' ') || value.ends_with(' ') || value.contains(['#', ';'])
    {
        "\""
    } else {
        ""
    };
    let _ = write!(out, "\t{key} = {quote}");
    for c in value.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '"' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    let _ = writeln!(out, "{quote}");
    Ok(())
}
