use regex::Regex;

/// Shell-style pattern (`*`, `?`, `[seq]`, `[!seq]`) compiled to an anchored
/// regex.
#[derive(Clone, Debug)]
pub struct Glob {
    regex: Regex,
}

impl Glob {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Regex::new(&translate(pattern)).map(|regex| Self { regex })
    }

    pub fn is_match(&self, candidate: &str) -> bool {
        self.regex.is_match(candidate)
    }

    pub fn filter<'a, I>(&self, candidates: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        candidates
            .into_iter()
            .filter(|c| self.is_match(c))
            .cloned()
            .collect()
    }
}

/// Whether `pattern` contains a wildcard at all.
pub fn has_wildcard(pattern: &str) -> bool {
    pattern.contains(['*', '?'])
}

fn translate(pattern: &str) -> String {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::from("^");
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => match chars[i + 1..].iter().position(|&c| c == ']') {
                Some(end) if end > 0 => {
                    let class: String = chars[i + 1..i + 1 + end].iter().collect();
                    let class = match class.strip_prefix('!') {
                        Some(rest) => format!("^{}", rest.replace('\\', "\\\\")),
                        None => class.replace('\\', "\\\\"),
                    };
                    out.push('[');
                    out.push_str(&class);
                    out.push(']');
                    i += end + 1;
                }
                _ => out.push_str("\\["),
            },
            c => out.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }
    out.push('$');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_and_question() {
        let glob = Glob::new("team/app-?.*").unwrap();
        assert!(glob.is_match("team/app-1.0"));
        assert!(!glob.is_match("team/app-10.0"));
        assert!(!glob.is_match("other/team/app-1.0"));
    }

    #[test]
    fn character_classes() {
        let glob = Glob::new("v[0-9]").unwrap();
        assert!(glob.is_match("v7"));
        assert!(!glob.is_match("vx"));

        let negated = Glob::new("v[!0-9]").unwrap();
        assert!(negated.is_match("vx"));
        assert!(!negated.is_match("v7"));
    }

    #[test]
    fn literals_are_escaped() {
        let glob = Glob::new("app+1.0").unwrap();
        assert!(glob.is_match("app+1.0"));
        assert!(!glob.is_match("app+1x0"));
        assert!(has_wildcard("*"));
        assert!(!has_wildcard("latest"));
    }
}
