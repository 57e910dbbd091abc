//! `{name}` path templates.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(String),
}

/// A parsed path template such as `/items/{id}/tags/{tag}`.
#[derive(Clone, PartialEq, Eq)]
pub struct PathTemplate {
    raw: String,
    segments: Vec<Segment>,
}

impl PathTemplate {
    /// Split `raw` into literals and placeholders.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem when braces are unbalanced,
    /// nested, or enclose an empty name.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = raw.char_indices();

        while let Some((at, c)) = chars.next() {
            match c {
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for (_, c) in chars.by_ref() {
                        match c {
                            '}' => {
                                closed = true;
                                break;
                            }
                            '{' => return Err(format!("nested '{{' in placeholder at offset {at}")),
                            c => name.push(c),
                        }
                    }
                    if !closed {
                        return Err(format!("unclosed '{{' at offset {at}"));
                    }
                    let name = name.trim();
                    if name.is_empty() {
                        return Err(format!("empty placeholder at offset {at}"));
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Placeholder(name.to_owned()));
                }
                '}' => return Err(format!("unmatched '}}' at offset {at}")),
                c => literal.push(c),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            raw: raw.to_owned(),
            segments,
        })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Placeholder names in order of appearance (repeats included).
    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Placeholder(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    /// Substitute every placeholder with the value `resolve` returns for it.
    ///
    /// # Errors
    ///
    /// Returns the name of the first placeholder `resolve` has no value for.
    pub fn expand<'v>(
        &self,
        mut resolve: impl FnMut(&str) -> Option<&'v str>,
    ) -> Result<String, &str> {
        let mut out = String::with_capacity(self.raw.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder(name) => out.push_str(resolve(name).ok_or(name.as_str())?),
            }
        }
        Ok(out)
    }
}

impl fmt::Debug for PathTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PathTemplate").field(&self.raw).finish()
    }
}
