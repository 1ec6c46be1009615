//! `cm_iam::ProvisioningActions` implementation. The password check stands
//! in for the PKCS#11-backed credential exchange the real agent performs
//!; key/cert issuance is left
//! as an explicit `eNotSupported` until that seam is filled in, rather than
//! faked, so a misconfigured deployment fails loudly instead of minting
//! certificates nobody can verify.

use async_trait::async_trait;
use cm_iam::ProvisioningActions;
use cm_proto::{CmError, CmResult, ErrorKind};

pub struct PasswordGatedProvisioning {
    expected_password: String,
}

impl PasswordGatedProvisioning {
    pub fn new(expected_password: String) -> Self {
        Self { expected_password }
    }

    fn check(&self, password: &str) -> CmResult<()> {
        if password == self.expected_password {
            Ok(())
        } else {
            Err(CmError::new(ErrorKind::InvalidArgument, "incorrect provisioning password"))
        }
    }
}

#[async_trait]
impl ProvisioningActions for PasswordGatedProvisioning {
    async fn start_provisioning(&self, password: &str) -> CmResult<()> {
        self.check(password)
    }

    async fn finish_provisioning(&self, password: &str) -> CmResult<()> {
        self.check(password)
    }

    async fn deprovision(&self, password: &str) -> CmResult<()> {
        self.check(password)
    }

    async fn create_key(&self, _cert_type: &str, _subject: &str) -> CmResult<String> {
        Err(CmError::new(ErrorKind::NotSupported, "key issuance requires a PKCS#11-backed agent, not configured"))
    }

    async fn apply_cert(&self, _cert_type: &str, _cert: &str) -> CmResult<(String, Vec<u8>)> {
        Err(CmError::new(ErrorKind::NotSupported, "certificate application requires a PKCS#11-backed agent, not configured"))
    }

    async fn cert_types(&self) -> CmResult<Vec<String>> {
        Ok(Vec::new())
    }
}
