use std::fmt::{Debug, Display, Formatter};
use std::ops::Deref;

/// A tag is a key/value byte-string pair attached to a series.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Tag {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Tag {
    pub fn new(key: Vec<u8>, value: Vec<u8>) -> Self {
        Self { key, value }
    }

    pub fn size(&self) -> usize {
        self.key.len() + self.value.len()
    }
}

// tag bytes are arbitrary and not guaranteed UTF-8
impl Debug for Tag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let key = String::from_utf8_lossy(&self.key);
        let value = String::from_utf8_lossy(&self.value);

        f.debug_struct("Tag")
            .field("key", &key)
            .field("value", &value)
            .finish()
    }
}

impl Display for Tag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let key = String::from_utf8_lossy(&self.key);
        let value = String::from_utf8_lossy(&self.value);
        write!(f, "{{{} {}}}", key, value)
    }
}

/// The tag set of a series. Canonical form is sorted by key, then value.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tags(Vec<Tag>);

impl Tags {
    pub fn new(tags: Vec<Tag>) -> Self {
        Self(tags)
    }

    pub fn size(&self) -> usize {
        self.0.iter().map(|x| x.size()).sum()
    }

    /// Sorts tags into canonical order.
    pub fn sort(&mut self) {
        self.0.sort();
    }

    pub fn push(&mut self, tag: Tag) {
        self.0.push(tag);
    }

    pub fn into_inner(self) -> Vec<Tag> {
        self.0
    }
}

impl Deref for Tags {
    type Target = [Tag];

    fn deref(&self) -> &Self::Target {
        self.0.as_slice()
    }
}

impl Display for Tags {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, tag) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}", tag)?;
        }
        write!(f, "]")
    }
}

impl FromIterator<(Vec<u8>, Vec<u8>)> for Tags {
    fn from_iter<T: IntoIterator<Item = (Vec<u8>, Vec<u8>)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| Tag::new(k, v)).collect())
    }
}
