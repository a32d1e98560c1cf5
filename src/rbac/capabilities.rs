// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Key Vault data-plane capabilities and sets of them.

use serde::{Deserialize, Serialize};

/// A Key Vault data-plane operation the broker needs permission for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Capability {
    GetSecret,
    ReadCertificateProperties,
    SignWithKey,
}

impl Capability {
    pub const ALL: [Capability; 3] = [
        Capability::GetSecret,
        Capability::ReadCertificateProperties,
        Capability::SignWithKey,
    ];

    pub const fn bit(self) -> u32 {
        match self {
            Capability::GetSecret => 1,
            Capability::ReadCertificateProperties => 2,
            Capability::SignWithKey => 4,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Capability::GetSecret => "GetSecret",
            Capability::ReadCertificateProperties => "ReadCertificateProperties",
            Capability::SignWithKey => "SignWithKey",
        }
    }

    /// The Azure RBAC data action guarding this capability.
    pub const fn data_action(self) -> &'static str {
        match self {
            Capability::GetSecret => "Microsoft.KeyVault/vaults/secrets/getSecret/action",
            Capability::ReadCertificateProperties => "Microsoft.KeyVault/vaults/certificates/read",
            Capability::SignWithKey => "Microsoft.KeyVault/vaults/keys/sign/action",
        }
    }
}

impl core::fmt::Display for Capability {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// A set over the closed [`Capability`] enumeration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CapabilitySet {
    bits: u32,
}

impl CapabilitySet {
    const MASK: u32 = 0b111;

    pub const fn empty() -> Self {
        Self { bits: 0 }
    }

    pub const fn all() -> Self {
        Self { bits: Self::MASK }
    }

    /// Unknown bits are dropped.
    pub const fn from_bits(bits: u32) -> Self {
        Self {
            bits: bits & Self::MASK,
        }
    }

    pub const fn bits(self) -> u32 {
        self.bits
    }

    pub const fn is_empty(self) -> bool {
        self.bits == 0
    }

    pub const fn contains(self, capability: Capability) -> bool {
        self.bits & capability.bit() != 0
    }

    pub fn insert(&mut self, capability: Capability) {
        self.bits |= capability.bit();
    }

    pub fn remove(&mut self, capability: Capability) {
        self.bits &= !capability.bit();
    }

    pub const fn with(self, capability: Capability) -> Self {
        Self {
            bits: self.bits | capability.bit(),
        }
    }

    pub const fn union(self, other: Self) -> Self {
        Self {
            bits: self.bits | other.bits,
        }
    }

    pub const fn intersection(self, other: Self) -> Self {
        Self {
            bits: self.bits & other.bits,
        }
    }

    /// `self` with every member of `other` removed.
    pub const fn without_all(self, other: Self) -> Self {
        Self {
            bits: self.bits & !other.bits,
        }
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.bits & other.bits != 0
    }

    pub const fn superset_of(self, other: Self) -> bool {
        self.bits & other.bits == other.bits
    }

    pub fn iter(self) -> impl Iterator<Item = Capability> {
        Capability::ALL
            .into_iter()
            .filter(move |c| self.contains(*c))
    }

    /// `"None"` for the empty set, otherwise member names joined by `", "`.
    pub fn display_name(self) -> String {
        if self.is_empty() {
            return "None".to_string();
        }
        self.iter()
            .map(Capability::name)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        let mut set = CapabilitySet::empty();
        for capability in iter {
            set.insert(capability);
        }
        set
    }
}

impl From<Capability> for CapabilitySet {
    fn from(capability: Capability) -> Self {
        CapabilitySet::empty().with(capability)
    }
}

impl Serialize for CapabilitySet {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl core::fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.display_name())
    }
}
