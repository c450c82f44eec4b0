use std::sync::Arc;

use dashmap::DashMap;
use foldhash::fast::RandomState;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    Broker, QueueOptions, Result,
    headers::{self, FieldValue, HeaderPredicate, Headers},
};

/// Return type marking a fire-and-forget method.
pub const VOID: &str = "void";

/// Version of the canonical signature encoding hashed into queue identities.
///
/// Any change to [`Signature::canonical`] changes every queue name and breaks
/// agreement between peers built against different versions.
pub const CANONICAL_FORMAT_VERSION: u32 = 1;

/// Static shape of a remote method.
///
/// Two peers that construct the same `Signature` derive the same
/// [`QueueIdentity`] without ever talking to each other.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Signature {
    pub return_type: String,
    pub name: String,
    pub args: Vec<String>,
}

impl Signature {
    /// # Examples
    ///
    /// ```rust
    /// # use ruamq::Signature;
    /// let sig = Signature::new("String", "Svc.Add", ["i32", "i32"]);
    /// assert_eq!(sig.canonical(), "String Svc.Add(i32, i32);");
    /// ```
    pub fn new<I, S>(return_type: impl Into<String>, name: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            return_type: return_type.into(),
            name: name.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether the method returns nothing, so callers never wait.
    #[must_use]
    pub fn is_void(&self) -> bool {
        self.return_type == VOID
    }

    /// Canonical encoding: `"{return} {name}({arg1, arg2, ...});"`.
    #[must_use]
    pub fn canonical(&self) -> String {
        format!(
            "{} {}({});",
            self.return_type,
            self.name,
            self.args.join(", ")
        )
    }

    /// Computes the queue identity: hex-encoded SHA-256 of the canonical form.
    #[must_use]
    pub fn identity(&self) -> QueueIdentity {
        let digest = Sha256::digest(self.canonical().as_bytes());
        QueueIdentity(hex::encode(digest))
    }

    /// Headers an RPC request for this signature carries.
    #[must_use]
    pub fn headers(&self) -> Headers {
        Headers::from([
            (
                headers::RETURN_TYPE.to_owned(),
                self.return_type.as_str().into(),
            ),
            (headers::SIGNATURE.to_owned(), self.name.as_str().into()),
            (headers::ARGS.to_owned(), self.args.clone().into()),
        ])
    }

    /// Binding predicate selecting requests for this signature.
    #[must_use]
    pub fn predicate(&self) -> HeaderPredicate {
        HeaderPredicate::all(self.headers())
    }

    /// Recovers a signature from request headers.
    ///
    /// A missing `args` header reads as an empty parameter list.
    #[must_use]
    pub fn from_headers(headers: &Headers) -> Option<Self> {
        let return_type = headers.get(headers::RETURN_TYPE)?.as_str()?;
        let name = headers.get(headers::SIGNATURE)?.as_str()?;
        let args = match headers.get(headers::ARGS) {
            Some(value) => value.as_str_array()?,
            None => vec![],
        };
        Some(Self::new(return_type, name, args))
    }
}

impl std::fmt::Display for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// Queue name derived from a [`Signature`].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct QueueIdentity(String);

impl QueueIdentity {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QueueIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<QueueIdentity> for FieldValue {
    fn from(value: QueueIdentity) -> Self {
        FieldValue::Str(value.0)
    }
}

/// Declares signature queues on the broker, once per signature per process.
pub struct SignatureRegistry {
    broker: Arc<dyn Broker>,
    exchange: String,
    declared: DashMap<QueueIdentity, Signature, RandomState>,
}

impl SignatureRegistry {
    /// Creates a registry declaring queues on `broker`, bound to `exchange`.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, exchange: impl Into<String>) -> Self {
        Self {
            broker,
            exchange: exchange.into(),
            declared: DashMap::default(),
        }
    }

    /// Declares the durable queue of `signature` and binds it on the shared
    /// exchange with a header predicate carrying the three signature fields.
    ///
    /// # Errors
    ///
    /// Returns the broker error if the declaration or binding fails. A failed
    /// declaration is retried on the next call.
    pub fn declare(&self, signature: &Signature) -> Result<QueueIdentity> {
        let identity = signature.identity();
        if let Some(known) = self.declared.get(&identity) {
            if *known != *signature {
                tracing::error!(
                    "queue identity collision: {identity} is shared by `{}` and `{signature}`",
                    *known
                );
            }
            return Ok(identity);
        }

        self.broker
            .declare_queue(identity.as_str(), QueueOptions::durable())?;
        self.broker
            .bind_queue(identity.as_str(), &self.exchange, &signature.predicate())?;
        tracing::debug!("declared {identity} for `{signature}`");
        self.declared.insert(identity.clone(), signature.clone());
        Ok(identity)
    }

    /// Whether `signature` was declared through this registry.
    #[must_use]
    pub fn is_declared(&self, signature: &Signature) -> bool {
        self.declared.contains_key(&signature.identity())
    }
}

impl std::fmt::Debug for SignatureRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureRegistry")
            .field("exchange", &self.exchange)
            .field("declared", &self.declared.len())
            .finish()
    }
}
