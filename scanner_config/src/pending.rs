use std::collections::BTreeMap;
use std::fmt::Write as _;

use scanner_traits::ConfigStore;

#[derive(Debug, Clone, PartialEq, Eq)]
enum SectionChange {
    Set(BTreeMap<String, String>),
    Removed,
}

/// Config changes recorded at runtime and written out on SAVE_CONFIG.
///
/// Setting a key in a section that was removed earlier in the session
/// revives the section with only the new keys.
#[derive(Debug, Default, Clone)]
pub struct PendingConfig {
    sections: BTreeMap<String, SectionChange>,
}

impl PendingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        match self.sections.get(section)? {
            SectionChange::Set(kv) => kv.get(key).map(String::as_str),
            SectionChange::Removed => None,
        }
    }

    pub fn is_removed(&self, section: &str) -> bool {
        matches!(self.sections.get(section), Some(SectionChange::Removed))
    }

    /// Render the pending changes as a SAVE_CONFIG style block.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (section, change) in &self.sections {
            match change {
                SectionChange::Removed => {
                    let _ = writeln!(out, "#*# [{section}] (removed)");
                }
                SectionChange::Set(kv) => {
                    let _ = writeln!(out, "#*# [{section}]");
                    for (k, v) in kv {
                        let mut lines = v.lines();
                        let first = lines.next().unwrap_or_default();
                        let _ = writeln!(out, "#*# {k} = {first}");
                        for cont in lines {
                            let _ = writeln!(out, "#*# {cont}");
                        }
                    }
                }
            }
        }
        out
    }
}

impl ConfigStore for PendingConfig {
    fn set(&mut self, section: &str, key: &str, value: &str) {
        let entry = self
            .sections
            .entry(section.to_string())
            .or_insert_with(|| SectionChange::Set(BTreeMap::new()));
        if matches!(entry, SectionChange::Removed) {
            *entry = SectionChange::Set(BTreeMap::new());
        }
        if let SectionChange::Set(kv) = entry {
            kv.insert(key.to_string(), value.to_string());
        }
    }

    fn remove_section(&mut self, section: &str) {
        self.sections
            .insert(section.to_string(), SectionChange::Removed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_after_remove_revives_section() {
        let mut p = PendingConfig::new();
        p.set("scanner model default", "model_temp", "30.0");
        p.remove_section("scanner model default");
        assert!(p.is_removed("scanner model default"));
        assert_eq!(p.get("scanner model default", "model_temp"), None);
        p.set("scanner model default", "model_offset", "0.00000");
        assert!(!p.is_removed("scanner model default"));
        assert_eq!(p.get("scanner model default", "model_offset"), Some("0.00000"));
        assert_eq!(p.get("scanner model default", "model_temp"), None);
    }

    #[test]
    fn render_continues_multiline_values() {
        let mut p = PendingConfig::new();
        p.set("scanner model x", "model_coef", "1.0,\n  2.0");
        let out = p.render();
        assert!(out.contains("#*# [scanner model x]"));
        assert!(out.contains("#*# model_coef = 1.0,"));
        assert!(out.contains("#*#   2.0"));
    }
}
