use std::fmt;

/// An ordered sequence of path segments identifying a registration.
///
/// Two names are equal iff their segment sequences are equal; the canonical
/// string form joins segments with `/` and is only used for display and
/// error messages, never for comparison.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceName {
    segments: Vec<String>,
}

impl ServiceName {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    pub fn single(segment: impl Into<String>) -> Self {
        Self {
            segments: vec![segment.into()],
        }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn append(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("/"))
    }
}

impl From<&str> for ServiceName {
    fn from(s: &str) -> Self {
        ServiceName::single(s)
    }
}

impl From<String> for ServiceName {
    fn from(s: String) -> Self {
        ServiceName::single(s)
    }
}
