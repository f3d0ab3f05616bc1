//! Exchange configuration.

use serde::{Deserialize, Serialize};

use crate::error::{MeshError, Result};
use crate::protocol::{tags, Tag};

/// Message tags used by one redistribution instance.
///
/// Forward data and backward gradients travel on different tags so the two
/// directions can never be confused on a shared channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// Tag for source-to-destination data.
    pub forward_tag: Tag,
    /// Tag for destination-to-source gradients.
    pub backward_tag: Tag,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            forward_tag: 111,
            backward_tag: 113,
        }
    }
}

impl ExchangeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_forward_tag(mut self, tag: Tag) -> Self {
        self.forward_tag = tag;
        self
    }

    pub fn with_backward_tag(mut self, tag: Tag) -> Self {
        self.backward_tag = tag;
        self
    }

    /// Reject equal tags and tags in the internal range.
    pub fn validate(&self) -> Result<()> {
        if self.forward_tag == self.backward_tag {
            return Err(MeshError::Config(format!(
                "forward and backward tags are both {}",
                self.forward_tag
            )));
        }
        for tag in [self.forward_tag, self.backward_tag] {
            if tags::is_reserved(tag) {
                return Err(MeshError::Config(format!(
                    "tag {tag:#x} is reserved for internal traffic"
                )));
            }
        }
        Ok(())
    }
}
