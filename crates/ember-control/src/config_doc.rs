//! Line-preserving model of INI and `.properties` files.
//!
//! Lines that are not touched render back byte for byte, so comments and keys
//! the engine does not manage survive an edit.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    /// `[section]` headers, `key=value`, `;` or `#` comments.
    Ini,
    /// No sections, `key=value` or `key: value`, `#` or `!` comments.
    Properties,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    Verbatim(String),
    Section { name: String, raw: String },
    Entry {
        key: String,
        value: String,
        raw: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigDocument {
    flavor: Flavor,
    lines: Vec<Line>,
    separator: &'static str,
}

impl ConfigDocument {
    pub fn new(flavor: Flavor) -> Self {
        Self {
            flavor,
            lines: Vec::new(),
            separator: "=",
        }
    }

    pub fn parse(text: &str, flavor: Flavor) -> Self {
        let mut doc = Self::new(flavor);
        let mut spaced = 0usize;
        let mut entries = 0usize;
        for raw in text.lines() {
            let trimmed = raw.trim();
            let is_comment = match flavor {
                Flavor::Ini => trimmed.starts_with(';') || trimmed.starts_with('#'),
                Flavor::Properties => trimmed.starts_with('#') || trimmed.starts_with('!'),
            };
            if trimmed.is_empty() || is_comment {
                doc.lines.push(Line::Verbatim(raw.to_string()));
                continue;
            }
            if flavor == Flavor::Ini
                && let Some(name) = trimmed.strip_prefix('[').and_then(|s| s.strip_suffix(']'))
            {
                doc.lines.push(Line::Section {
                    name: name.trim().to_string(),
                    raw: raw.to_string(),
                });
                continue;
            }
            let split = match flavor {
                Flavor::Ini => trimmed.find('='),
                Flavor::Properties => trimmed.find(['=', ':']),
            };
            match split {
                Some(at) => {
                    entries += 1;
                    if trimmed[..at].ends_with(' ') {
                        spaced += 1;
                    }
                    doc.lines.push(Line::Entry {
                        key: trimmed[..at].trim().to_string(),
                        value: trimmed[at + 1..].trim().to_string(),
                        raw: Some(raw.to_string()),
                    });
                }
                None => doc.lines.push(Line::Verbatim(raw.to_string())),
            }
        }
        // New keys follow the file's existing spacing convention.
        if entries > 0 && spaced * 2 > entries {
            doc.separator = " = ";
        }
        doc
    }

    pub fn flavor(&self) -> Flavor {
        self.flavor
    }

    /// Index range `[start, end)` of lines belonging to `section`; `None`
    /// addresses the lines before the first header.
    fn section_range(&self, section: Option<&str>) -> Option<(usize, usize)> {
        let start = match section {
            None => 0,
            Some(want) => {
                self.lines
                    .iter()
                    .position(|l| matches!(l, Line::Section { name, .. } if name == want))?
                    + 1
            }
        };
        let end = self.lines[start..]
            .iter()
            .position(|l| matches!(l, Line::Section { .. }))
            .map(|i| start + i)
            .unwrap_or(self.lines.len());
        Some((start, end))
    }

    fn find(&self, section: Option<&str>, key: &str) -> Option<usize> {
        let (start, end) = self.section_range(section)?;
        (start..end).find(|&i| matches!(&self.lines[i], Line::Entry { key: k, .. } if k == key))
    }

    pub fn get(&self, section: Option<&str>, key: &str) -> Option<&str> {
        let i = self.find(section, key)?;
        match &self.lines[i] {
            Line::Entry { value, .. } => Some(value.as_str()),
            _ => None,
        }
    }

    /// Updates `key` in place, or appends it to the end of `section`
    /// (creating the section when missing).
    pub fn set(&mut self, section: Option<&str>, key: &str, value: impl Into<String>) {
        let value = value.into();
        if let Some(i) = self.find(section, key) {
            if let Line::Entry { value: v, raw, .. } = &mut self.lines[i]
                && *v != value
            {
                *v = value;
                *raw = None;
            }
            return;
        }

        let entry = Line::Entry {
            key: key.to_string(),
            value,
            raw: None,
        };
        match self.section_range(section) {
            Some((start, end)) => {
                // Keep trailing blank lines after the new key.
                let mut at = end;
                while at > start && matches!(&self.lines[at - 1], Line::Verbatim(s) if s.trim().is_empty()) {
                    at -= 1;
                }
                self.lines.insert(at, entry);
            }
            None => {
                if let Some(name) = section {
                    if self
                        .lines
                        .last()
                        .is_some_and(|l| !matches!(l, Line::Verbatim(s) if s.trim().is_empty()))
                    {
                        self.lines.push(Line::Verbatim(String::new()));
                    }
                    self.lines.push(Line::Section {
                        name: name.to_string(),
                        raw: format!("[{name}]"),
                    });
                }
                self.lines.push(entry);
            }
        }
    }

    pub fn remove(&mut self, section: Option<&str>, key: &str) -> bool {
        match self.find(section, key) {
            Some(i) => {
                self.lines.remove(i);
                true
            }
            None => false,
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            match line {
                Line::Verbatim(raw) | Line::Section { raw, .. } => out.push_str(raw),
                Line::Entry {
                    raw: Some(raw), ..
                } => out.push_str(raw),
                Line::Entry {
                    key,
                    value,
                    raw: None,
                } => {
                    out.push_str(key);
                    out.push_str(self.separator);
                    out.push_str(value);
                }
            }
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GUS: &str = "; managed by hand\n[ServerSettings]\nServerPVE=True\nCustomKey=keep me\n\n[SessionSettings]\nSessionName=old\n";

    #[test]
    fn untouched_document_round_trips_exactly() {
        let doc = ConfigDocument::parse(GUS, Flavor::Ini);
        assert_eq!(doc.render(), GUS);
    }

    #[test]
    fn edits_preserve_unknown_keys_and_comments() {
        let mut doc = ConfigDocument::parse(GUS, Flavor::Ini);
        doc.set(Some("SessionSettings"), "SessionName", "Ember Island");
        doc.set(Some("ServerSettings"), "RCONEnabled", "True");
        doc.set(Some("MessageOfTheDay"), "Message", "hi");
        let out = doc.render();

        assert!(out.starts_with("; managed by hand\n"));
        assert!(out.contains("CustomKey=keep me\n"));
        assert!(out.contains("ServerPVE=True\nCustomKey=keep me\nRCONEnabled=True\n\n[SessionSettings]"));
        assert!(out.contains("SessionName=Ember Island\n"));
        assert!(out.ends_with("[MessageOfTheDay]\nMessage=hi\n"));

        let again = ConfigDocument::parse(&out, Flavor::Ini);
        assert_eq!(again.get(Some("ServerSettings"), "CustomKey"), Some("keep me"));
        assert_eq!(again.get(Some("MessageOfTheDay"), "Message"), Some("hi"));
    }

    #[test]
    fn properties_accept_colon_and_bang_comments() {
        let text = "#Minecraft server properties\n! legacy comment\nmotd: hello\nserver-port=25565\n";
        let mut doc = ConfigDocument::parse(text, Flavor::Properties);
        assert_eq!(doc.get(None, "motd"), Some("hello"));
        doc.set(None, "server-port", "25566");
        doc.set(None, "enable-rcon", "true");
        let out = doc.render();
        assert!(out.contains("! legacy comment\nmotd: hello\nserver-port=25566\nenable-rcon=true\n"));
        assert!(doc.remove(None, "motd"));
        assert_eq!(doc.get(None, "motd"), None);
    }

    #[test]
    fn new_keys_follow_spaced_convention() {
        let mut doc = ConfigDocument::parse("[NETWORK]\nserver_port = 10999\n", Flavor::Ini);
        doc.set(Some("NETWORK"), "cluster_name", "Ember");
        assert_eq!(doc.render(), "[NETWORK]\nserver_port = 10999\ncluster_name = Ember\n");
    }
}
