//! Admission-time face verification.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::detector::{DetectorChain, Evidence, FaceCheck, METHOD_CLIENT};

/// How far the client's own "face detected" verdict is trusted. The verdict
/// is whatever the submitter posted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientTrust {
    /// A positive client verdict admits on its own.
    #[default]
    Sufficient,
    /// A positive client verdict is recorded, but a server tier must also pass.
    Corroborate,
}

impl FromStr for ClientTrust {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sufficient" => Ok(ClientTrust::Sufficient),
            "corroborate" => Ok(ClientTrust::Corroborate),
            other => Err(format!("unknown client trust policy '{other}'")),
        }
    }
}

pub struct FaceVerifier {
    chain: DetectorChain,
    trust: ClientTrust,
}

impl FaceVerifier {
    pub fn new(chain: DetectorChain, trust: ClientTrust) -> Self {
        Self { chain, trust }
    }

    pub fn trust(&self) -> ClientTrust {
        self.trust
    }

    /// Active server-side tiers, strongest first.
    pub fn tiers(&self) -> Vec<&'static str> {
        self.chain.methods()
    }

    /// Decide whether a submission shows a face.
    ///
    /// `image` is the decoded payload, if one was supplied and decoded.
    pub fn verify_submission(
        &mut self,
        client_detected: bool,
        client_confidence: Option<f32>,
        image: Option<&[u8]>,
    ) -> FaceCheck {
        if client_detected && self.trust == ClientTrust::Sufficient {
            return FaceCheck::passed(
                METHOD_CLIENT,
                client_confidence.unwrap_or(1.0),
                Evidence::ClientAsserted,
            );
        }

        match image {
            Some(bytes) => self.chain.run(bytes),
            None => {
                tracing::debug!(client_detected, "no image to check server-side");
                FaceCheck::failed(METHOD_CLIENT)
            }
        }
    }
}
