// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The versioned storage holding desired and current state documents.

use crate::model::{
    CurrentState, DesiredSpec, MasterKey, NodeAgentCurrent, NodeAgentSpec,
};

use async_trait::async_trait;
use std::collections::BTreeMap;

pub type NodeAgentsCurrent = BTreeMap<String, NodeAgentCurrent>;
pub type NodeAgentsDesired = BTreeMap<String, NodeAgentSpec>;

/// A desired-state document as read from the store.
#[derive(Clone, Debug, PartialEq)]
pub struct DesiredDocument {
    pub spec: DesiredSpec,
    /// The document was written by an older schema and was migrated while
    /// parsing.  It is pushed back before anything else happens.
    pub migrated: bool,
}

/// Reads and writes state documents.
///
/// Secrets inside documents are decrypted and encrypted with the
/// [`MasterKey`] handed to each call.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn desired(&self, key: &MasterKey) -> anyhow::Result<DesiredDocument>;

    async fn current(&self, key: &MasterKey) -> anyhow::Result<CurrentState>;

    async fn node_agents_current(&self) -> anyhow::Result<NodeAgentsCurrent>;

    async fn node_agents_desired(&self) -> anyhow::Result<NodeAgentsDesired>;

    /// Reads an arbitrary file, `None` if it does not exist.
    async fn read_file(&self, path: &str) -> anyhow::Result<Option<Vec<u8>>>;

    async fn push_desired(
        &self,
        spec: &DesiredSpec,
        key: &MasterKey,
        message: &str,
    ) -> anyhow::Result<()>;

    /// Writes the current state together with what node agents should do.
    async fn push_current(
        &self,
        current: &CurrentState,
        agents: &NodeAgentsDesired,
        key: &MasterKey,
        message: &str,
    ) -> anyhow::Result<()>;

    /// Records that a pass failed.
    async fn push_error(&self, error: &str) -> anyhow::Result<()>;
}
