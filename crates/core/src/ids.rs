// Copyright (C) 2024-2026 The Ocap Kernel Project.
//
// ids.rs file belongs to the ocap-rs project and is free
// software distributed under the MIT software license, see the
// accompanying file LICENSE in the main directory of the
// repository for more details.
//
// Redistribution and use in source and binary forms with or without
// modifications are permitted.

//! Identifier types for vats, remotes, kernel refs and endpoint refs.
//!
//! Every identifier has a strict lexical shape so that the string forms
//! sort totally and the type of a ref can be recovered from its text:
//!
//! * `v<N>`: vat id
//! * `r<N>`: remote id
//! * `ko<N>`: kernel object ref
//! * `kp<N>`: kernel promise ref
//! * `o+<N>` / `o-<N>`: endpoint object ref (exported / imported)
//! * `p+<N>` / `p-<N>`: endpoint promise ref

use crate::{CoreError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Parses the decimal index portion of an identifier.
fn parse_index(text: &str, whole: &str) -> Result<u64> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CoreError::invalid_ref(format!(
            "bad index in ref {whole:?}"
        )));
    }
    text.parse::<u64>()
        .map_err(|_| CoreError::invalid_ref(format!("index out of range in ref {whole:?}")))
}

macro_rules! impl_string_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(
                deserializer: D,
            ) -> std::result::Result<Self, D::Error> {
                let text = String::deserialize(deserializer)?;
                text.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

/// Identifies one local vat (`v<N>`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VatId(u64);

impl VatId {
    /// Creates a vat id from its numeric index.
    pub const fn new(index: u64) -> Self {
        VatId(index)
    }

    /// Returns the numeric index.
    pub const fn index(self) -> u64 {
        self.0
    }
}

impl fmt::Display for VatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl FromStr for VatId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let rest = s
            .strip_prefix('v')
            .ok_or_else(|| CoreError::invalid_ref(format!("not a vat id: {s:?}")))?;
        Ok(VatId(parse_index(rest, s)?))
    }
}

impl_string_serde!(VatId);

/// Identifies one remote peer kernel connection (`r<N>`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RemoteId(u64);

impl RemoteId {
    /// Creates a remote id from its numeric index.
    pub const fn new(index: u64) -> Self {
        RemoteId(index)
    }

    /// Returns the numeric index.
    pub const fn index(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

impl FromStr for RemoteId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let rest = s
            .strip_prefix('r')
            .ok_or_else(|| CoreError::invalid_ref(format!("not a remote id: {s:?}")))?;
        Ok(RemoteId(parse_index(rest, s)?))
    }
}

impl_string_serde!(RemoteId);

/// Anything the kernel exchanges refs with: a vat or a remote peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EndpointId {
    /// A local vat.
    Vat(VatId),
    /// A remote peer kernel.
    Remote(RemoteId),
}

impl EndpointId {
    /// Returns the vat id when this endpoint is a vat.
    pub fn as_vat(self) -> Option<VatId> {
        match self {
            EndpointId::Vat(v) => Some(v),
            EndpointId::Remote(_) => None,
        }
    }

    /// True when this endpoint is a vat.
    pub fn is_vat(self) -> bool {
        matches!(self, EndpointId::Vat(_))
    }
}

impl From<VatId> for EndpointId {
    fn from(v: VatId) -> Self {
        EndpointId::Vat(v)
    }
}

impl From<RemoteId> for EndpointId {
    fn from(r: RemoteId) -> Self {
        EndpointId::Remote(r)
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointId::Vat(v) => v.fmt(f),
            EndpointId::Remote(r) => r.fmt(f),
        }
    }
}

impl FromStr for EndpointId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.as_bytes().first() {
            Some(b'v') => Ok(EndpointId::Vat(s.parse()?)),
            Some(b'r') => Ok(EndpointId::Remote(s.parse()?)),
            _ => Err(CoreError::invalid_ref(format!("not an endpoint id: {s:?}"))),
        }
    }
}

impl_string_serde!(EndpointId);

/// Identifies one kernel object (`ko<N>`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KObjectId(u64);

impl KObjectId {
    /// Creates a kernel object id from its numeric index.
    pub const fn new(index: u64) -> Self {
        KObjectId(index)
    }

    /// Returns the numeric index.
    pub const fn index(self) -> u64 {
        self.0
    }
}

impl fmt::Display for KObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ko{}", self.0)
    }
}

impl FromStr for KObjectId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let rest = s
            .strip_prefix("ko")
            .ok_or_else(|| CoreError::invalid_ref(format!("not a kernel object ref: {s:?}")))?;
        Ok(KObjectId(parse_index(rest, s)?))
    }
}

impl_string_serde!(KObjectId);

/// Identifies one kernel promise (`kp<N>`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KPromiseId(u64);

impl KPromiseId {
    /// Creates a kernel promise id from its numeric index.
    pub const fn new(index: u64) -> Self {
        KPromiseId(index)
    }

    /// Returns the numeric index.
    pub const fn index(self) -> u64 {
        self.0
    }
}

impl fmt::Display for KPromiseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "kp{}", self.0)
    }
}

impl FromStr for KPromiseId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let rest = s
            .strip_prefix("kp")
            .ok_or_else(|| CoreError::invalid_ref(format!("not a kernel promise ref: {s:?}")))?;
        Ok(KPromiseId(parse_index(rest, s)?))
    }
}

impl_string_serde!(KPromiseId);

/// A kernel-wide reference: an object or a promise.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KRef {
    /// Reference to a kernel object.
    Object(KObjectId),
    /// Reference to a kernel promise.
    Promise(KPromiseId),
}

impl KRef {
    /// True for `kp<N>` refs.
    pub fn is_promise(self) -> bool {
        matches!(self, KRef::Promise(_))
    }

    /// True for `ko<N>` refs.
    pub fn is_object(self) -> bool {
        matches!(self, KRef::Object(_))
    }

    /// Returns the promise id when this ref names a promise.
    pub fn as_promise(self) -> Option<KPromiseId> {
        match self {
            KRef::Promise(p) => Some(p),
            KRef::Object(_) => None,
        }
    }

    /// Returns the object id when this ref names an object.
    pub fn as_object(self) -> Option<KObjectId> {
        match self {
            KRef::Object(o) => Some(o),
            KRef::Promise(_) => None,
        }
    }
}

impl From<KObjectId> for KRef {
    fn from(o: KObjectId) -> Self {
        KRef::Object(o)
    }
}

impl From<KPromiseId> for KRef {
    fn from(p: KPromiseId) -> Self {
        KRef::Promise(p)
    }
}

impl fmt::Display for KRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KRef::Object(o) => o.fmt(f),
            KRef::Promise(p) => p.fmt(f),
        }
    }
}

impl FromStr for KRef {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        if s.starts_with("ko") {
            Ok(KRef::Object(s.parse()?))
        } else if s.starts_with("kp") {
            Ok(KRef::Promise(s.parse()?))
        } else {
            Err(CoreError::invalid_ref(format!("not a kernel ref: {s:?}")))
        }
    }
}

impl_string_serde!(KRef);

/// Whether an endpoint ref names an object or a promise.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RefKind {
    /// An object ref (`o…`).
    Object,
    /// A promise ref (`p…`).
    Promise,
}

/// Which side of the endpoint boundary allocated an endpoint ref.
///
/// Direction is written from the endpoint's point of view: `+` means the
/// endpoint exported the ref, `-` means the kernel imported it into the
/// endpoint's namespace.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RefDir {
    /// Exported by the endpoint (`+`).
    Export,
    /// Imported into the endpoint (`-`).
    Import,
}

impl RefDir {
    fn sigil(self) -> char {
        match self {
            RefDir::Export => '+',
            RefDir::Import => '-',
        }
    }
}

/// An endpoint-local reference (`o+<N>`, `o-<N>`, `p+<N>`, `p-<N>`).
///
/// An `ERef` only has meaning inside one endpoint's c-list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ERef {
    kind: RefKind,
    dir: RefDir,
    index: u64,
}

impl ERef {
    /// Creates an endpoint object ref.
    pub const fn object(dir: RefDir, index: u64) -> Self {
        ERef {
            kind: RefKind::Object,
            dir,
            index,
        }
    }

    /// Creates an endpoint promise ref.
    pub const fn promise(dir: RefDir, index: u64) -> Self {
        ERef {
            kind: RefKind::Promise,
            dir,
            index,
        }
    }

    /// Returns whether this ref names an object or a promise.
    pub const fn kind(self) -> RefKind {
        self.kind
    }

    /// Returns the allocation direction.
    pub const fn dir(self) -> RefDir {
        self.dir
    }

    /// Returns the numeric index.
    pub const fn index(self) -> u64 {
        self.index
    }

    /// True for promise refs.
    pub fn is_promise(self) -> bool {
        self.kind == RefKind::Promise
    }

    /// True for refs the endpoint exported (`+` direction).
    pub fn is_export(self) -> bool {
        self.dir == RefDir::Export
    }

    /// Returns the same ref with the direction flipped.
    ///
    /// A peer's export is our import; remote handles apply this when a
    /// ref crosses the kernel/peer boundary.
    pub fn flipped(self) -> Self {
        ERef {
            kind: self.kind,
            dir: match self.dir {
                RefDir::Export => RefDir::Import,
                RefDir::Import => RefDir::Export,
            },
            index: self.index,
        }
    }
}

impl fmt::Display for ERef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            RefKind::Object => 'o',
            RefKind::Promise => 'p',
        };
        write!(f, "{}{}{}", kind, self.dir.sigil(), self.index)
    }
}

impl FromStr for ERef {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = s.as_bytes();
        let kind = match bytes.first() {
            Some(b'o') => RefKind::Object,
            Some(b'p') => RefKind::Promise,
            _ => {
                return Err(CoreError::invalid_ref(format!(
                    "not an endpoint ref: {s:?}"
                )))
            }
        };
        let dir = match bytes.get(1) {
            Some(b'+') => RefDir::Export,
            Some(b'-') => RefDir::Import,
            _ => {
                return Err(CoreError::invalid_ref(format!(
                    "endpoint ref missing direction: {s:?}"
                )))
            }
        };
        let index = parse_index(&s[2..], s)?;
        Ok(ERef { kind, dir, index })
    }
}

impl_string_serde!(ERef);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vat_and_remote_round_trip() {
        for n in [0u64, 1, 7, 40, 123456] {
            let v = VatId::new(n);
            assert_eq!(v.to_string().parse::<VatId>().unwrap(), v);
            let r = RemoteId::new(n);
            assert_eq!(r.to_string().parse::<RemoteId>().unwrap(), r);
        }
        assert_eq!("v12".parse::<VatId>().unwrap(), VatId::new(12));
        assert_eq!("r3".parse::<RemoteId>().unwrap(), RemoteId::new(3));
        assert!("v".parse::<VatId>().is_err());
        assert!("x7".parse::<VatId>().is_err());
        assert!("v1x".parse::<VatId>().is_err());
    }

    #[test]
    fn test_endpoint_id_recovers_type() {
        assert_eq!(
            "v4".parse::<EndpointId>().unwrap(),
            EndpointId::Vat(VatId::new(4))
        );
        assert_eq!(
            "r9".parse::<EndpointId>().unwrap(),
            EndpointId::Remote(RemoteId::new(9))
        );
        assert!("ko1".parse::<EndpointId>().is_err());
    }

    #[test]
    fn test_kref_round_trip() {
        assert_eq!(
            "ko7".parse::<KRef>().unwrap(),
            KRef::Object(KObjectId::new(7))
        );
        assert_eq!(
            "kp4".parse::<KRef>().unwrap(),
            KRef::Promise(KPromiseId::new(4))
        );
        for s in ["ko0", "kp12", "ko999"] {
            assert_eq!(s.parse::<KRef>().unwrap().to_string(), s);
        }
        assert!("k7".parse::<KRef>().is_err());
        assert!("ko".parse::<KRef>().is_err());
        assert!("kp-1".parse::<KRef>().is_err());
    }

    #[test]
    fn test_eref_round_trip() {
        let cases = [
            ("o+5", RefKind::Object, RefDir::Export, 5),
            ("o-3", RefKind::Object, RefDir::Import, 3),
            ("p+2", RefKind::Promise, RefDir::Export, 2),
            ("p-11", RefKind::Promise, RefDir::Import, 11),
        ];
        for (text, kind, dir, index) in cases {
            let eref = text.parse::<ERef>().unwrap();
            assert_eq!(eref.kind(), kind);
            assert_eq!(eref.dir(), dir);
            assert_eq!(eref.index(), index);
            assert_eq!(eref.to_string(), text);
        }
        assert!("o5".parse::<ERef>().is_err());
        assert!("q+5".parse::<ERef>().is_err());
        assert!("o+".parse::<ERef>().is_err());
    }

    #[test]
    fn test_eref_flip() {
        let eref = "o+5".parse::<ERef>().unwrap();
        assert_eq!(eref.flipped().to_string(), "o-5");
        assert_eq!(eref.flipped().flipped(), eref);
    }

    #[test]
    fn test_serde_as_strings() {
        let kref: KRef = serde_json::from_str("\"ko8\"").unwrap();
        assert_eq!(serde_json::to_string(&kref).unwrap(), "\"ko8\"");
        let eref: ERef = serde_json::from_str("\"p-1\"").unwrap();
        assert_eq!(serde_json::to_string(&eref).unwrap(), "\"p-1\"");
        let endpoint: EndpointId = serde_json::from_str("\"v2\"").unwrap();
        assert_eq!(serde_json::to_string(&endpoint).unwrap(), "\"v2\"");
    }
}
