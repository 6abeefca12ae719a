use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of a person within a `ResponseSet` or a `FitData` view.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PersonIndex(pub u32);

impl PersonIndex {
    pub fn new(index: usize) -> Self {
        Self(index as u32)
    }

    pub fn get(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PersonIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "person#{}", self.0)
    }
}

/// Position of an item within the item metadata of a `ResponseSet`.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemIndex(pub u32);

impl ItemIndex {
    pub fn new(index: usize) -> Self {
        Self(index as u32)
    }

    pub fn get(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ItemIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "item#{}", self.0)
    }
}

/// One observed answer in long format. Missing answers are never represented.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub person: PersonIndex,
    pub item: ItemIndex,
    pub category: u8,
}

/// Which population a person belongs to for screening purposes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Population {
    /// Known-genuine respondents: used for training and for the LOOCV null distribution.
    Reference,
    /// Respondents outside the training population, scored against the null.
    Scored,
}

impl Population {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Reference => "reference",
            Self::Scored => "scored",
        }
    }
}

impl fmt::Display for Population {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}
