// src/command/mechanism.rs

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_MECHANISM_ID: AtomicU64 = AtomicU64::new(1);

/// A named, exclusive resource that commands claim.
///
/// Identity is the instance, not the name: two mechanisms created with the
/// same name are still different resources. Clones refer to the same
/// mechanism.
#[derive(Clone)]
pub struct Mechanism {
    inner: Arc<MechanismInner>,
}

struct MechanismInner {
    id: u64,
    name: String,
}

impl Mechanism {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(MechanismInner {
                id: NEXT_MECHANISM_ID.fetch_add(1, Ordering::Relaxed),
                name: name.into(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }
}

impl PartialEq for Mechanism {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Mechanism {}

impl Hash for Mechanism {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mechanism")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish()
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.name)
    }
}
