//! Hardware module backend, built with the `tpm` feature.
//!
//! Context handling follows a typestate chain: an [`InitialContext`] either
//! creates a primary key and a PCR policy to seal under, or opens a PCR
//! policy session to unseal with. The TCTI is taken from the `TCTI`
//! environment variable.

use crate::attest::EkDigestProver;
use crate::seal::{self, SealStore};
use ambassador::{delegatable_trait, Delegate};
use once_cell::sync::OnceCell;
use pcr::PcrError;
use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tss_esapi::abstraction::ek;
use tss_esapi::attributes::{ObjectAttributes, SessionAttributes};
use tss_esapi::constants::{CapabilityType, SessionType, StartupType};
use tss_esapi::handles::{KeyHandle, PersistentTpmHandle, TpmHandle};
use tss_esapi::interface_types::algorithm::{
    AsymmetricAlgorithm, HashingAlgorithm, PublicAlgorithm,
};
use tss_esapi::interface_types::dynamic_handles::Persistent;
use tss_esapi::interface_types::ecc::EccCurve;
use tss_esapi::interface_types::resource_handles::{Hierarchy, Provision};
use tss_esapi::interface_types::session_handles::{AuthSession, HmacSession, PolicySession};
use tss_esapi::structures::{
    CapabilityData, CreateKeyResult, CreatePrimaryKeyResult, Digest, EccPoint, KeyedHashScheme,
    MaxBuffer, PcrSelectionList, Public, PublicEccParametersBuilder, PublicKeyedHashParameters,
    SensitiveData, SymmetricDefinition, SymmetricDefinitionObject,
};
use tss_esapi::tcti_ldr::TctiNameConf;
use tss_esapi::traits::Marshall;
use zeroize::Zeroizing;

pub mod pcr;

#[derive(Error, Debug)]
pub enum TpmError {
    #[error("failed to create auth session")]
    AuthSessionCreate,
    #[error("TPM context lock poisoned")]
    Poisoned,
    #[error(transparent)]
    TssEsapi(#[from] tss_esapi::Error),
    #[error(transparent)]
    PcrError(#[from] PcrError),
}

pub type Result<T, E = TpmError> = core::result::Result<T, E>;

pub type Context = MutexGuard<'static, tss_esapi::Context>;
pub trait TContext: DerefMut<Target = tss_esapi::Context> {}
impl TContext for Context {}

pub struct Ctx<C: TContext, S: ContextState> {
    ctx: C,
    state: S,
}

#[delegatable_trait]
trait FlushSession {
    fn flush_session(&mut self, session: AuthSession) -> Result<()>;
}

impl FlushSession for Context {
    fn flush_session(&mut self, session: AuthSession) -> Result<()> {
        let handle = match session {
            AuthSession::HmacSession(HmacSession::HmacSession { session_handle, .. }) => {
                Some(session_handle.into())
            }
            AuthSession::PolicySession(PolicySession::PolicySession { session_handle, .. }) => {
                Some(session_handle.into())
            }
            _ => None,
        };
        if let Some(handle) = handle {
            self.flush_context(handle)?;
        }
        Ok(())
    }
}

impl<C: TContext, S: ContextState> Ctx<C, S> {
    /// Removes whatever object is persisted at `handle`, if any.
    pub fn evict_persistent(&mut self, handle: PersistentTpmHandle) {
        if let Ok(retrieved) = self
            .ctx
            .execute_without_session(|ctx| ctx.tr_from_tpm_public(TpmHandle::Persistent(handle)))
        {
            // eviction needs an authorization session
            self.ctx
                .execute_with_session(Some(AuthSession::Password), |ctx| {
                    ctx.evict_control(Provision::Owner, retrieved, Persistent::Persistent(handle))
                })
                .ok();
        }
        self.flush_transient().ok();
    }

    fn flush_transient(&mut self) -> Result<()> {
        let (capabilities, _) = self.ctx.get_capability(CapabilityType::Handles, 0, 80)?;
        if let CapabilityData::Handles(handles) = capabilities {
            for handle in handles
                .into_inner()
                .into_iter()
                .filter(|h| matches!(h, TpmHandle::Transient(_)))
            {
                let handle = self
                    .ctx
                    .execute_without_session(|ctx| ctx.tr_from_tpm_public(handle))?;
                self.ctx.flush_context(handle).ok();
            }
        }
        Ok(())
    }

    fn make_session(&mut self, t: SessionType) -> Result<AuthSession> {
        let session = self
            .ctx
            .start_auth_session(
                None,
                None,
                None,
                t,
                SymmetricDefinition::AES_128_CFB,
                HashingAlgorithm::Sha256,
            )?
            .ok_or(TpmError::AuthSessionCreate)?;
        let (session_attributes, session_attributes_mask) = SessionAttributes::builder()
            .with_decrypt(true)
            .with_encrypt(true)
            .build();
        self.ctx
            .tr_sess_set_attributes(session, session_attributes, session_attributes_mask)?;
        Ok(session)
    }

    /// Hash over the concatenated values of the selected PCRs.
    fn pcr_digest(&mut self, pcr_selection_list: &PcrSelectionList) -> Result<Digest> {
        let (_update_counter, _selection_list, digest_list) = self
            .ctx
            .execute_without_session(|ctx| ctx.pcr_read(pcr_selection_list.clone()))?;

        let concatenated = digest_list
            .value()
            .iter()
            .map(|x| x.value())
            .collect::<Vec<&[u8]>>()
            .concat();
        let concatenated = MaxBuffer::try_from(concatenated)?;

        // must match the session hash, whatever bank the PCRs come from
        let (digest, _ticket) = self.ctx.execute_without_session(|ctx| {
            ctx.hash(concatenated, HashingAlgorithm::Sha256, Hierarchy::Owner)
        })?;
        Ok(digest)
    }
}

pub struct Initial;
pub type InitialContext = Ctx<Context, Initial>;
pub struct PrimaryKey;
#[derive(Delegate)]
#[delegate(FlushSession, target = "ctx")]
pub struct PkCtx {
    ctx: Context,
    pub key: KeyHandle,
}
impl Deref for PkCtx {
    type Target = tss_esapi::Context;
    fn deref(&self) -> &Self::Target {
        &self.ctx
    }
}
impl DerefMut for PkCtx {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.ctx
    }
}
impl Drop for PkCtx {
    fn drop(&mut self) {
        self.ctx.flush_context(self.key.into()).ok();
    }
}
impl TContext for PkCtx {}
pub type PrimaryKeyContext = Ctx<PkCtx, PrimaryKey>;
pub struct PcrPolicy {
    policy_digest: Digest,
}
pub type PcrPolicyContext = Ctx<PkCtx, PcrPolicy>;
pub struct PcrAuthed;
#[derive(Delegate)]
#[delegate(FlushSession, target = "ctx")]
pub struct PcrAuthedCtx {
    ctx: Context,
    pub session: AuthSession,
}
impl Deref for PcrAuthedCtx {
    type Target = tss_esapi::Context;
    fn deref(&self) -> &Self::Target {
        &self.ctx
    }
}
impl DerefMut for PcrAuthedCtx {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.ctx
    }
}
impl Drop for PcrAuthedCtx {
    fn drop(&mut self) {
        self.ctx.flush_session(self.session).ok();
    }
}
impl TContext for PcrAuthedCtx {}
pub type PcrAuthedContext = Ctx<PcrAuthedCtx, PcrAuthed>;

pub trait ContextState {}
impl ContextState for Initial {}
impl ContextState for PrimaryKey {}
impl ContextState for PcrPolicy {}
impl ContextState for PcrAuthed {}

impl InitialContext {
    pub fn pcr_auth(mut self, pcr_selection_list: &PcrSelectionList) -> Result<PcrAuthedContext> {
        let digest = self.pcr_digest(pcr_selection_list)?;
        let session = self.make_session(SessionType::Policy)?;
        self.ctx
            .policy_pcr(session.try_into()?, digest, pcr_selection_list.clone())?;
        Ok(PcrAuthedContext {
            ctx: PcrAuthedCtx {
                ctx: self.ctx,
                session,
            },
            state: PcrAuthed,
        })
    }

    pub fn create_primary(mut self) -> Result<PrimaryKeyContext> {
        let object_attributes = ObjectAttributes::builder()
            .with_fixed_tpm(true)
            .with_fixed_parent(true)
            .with_sensitive_data_origin(true)
            .with_user_with_auth(true)
            .with_decrypt(true)
            .with_sign_encrypt(false)
            .with_restricted(true)
            .build()?;

        let public = Public::builder()
            .with_public_algorithm(PublicAlgorithm::Ecc)
            .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
            .with_object_attributes(object_attributes)
            .with_ecc_parameters(
                PublicEccParametersBuilder::new_restricted_decryption_key(
                    SymmetricDefinitionObject::AES_128_CFB,
                    EccCurve::NistP256,
                )
                .build()?,
            )
            .with_ecc_unique_identifier(EccPoint::default())
            .build()?;

        let CreatePrimaryKeyResult {
            key_handle: key, ..
        } = self.ctx.execute_with_nullauth_session(|ctx| {
            ctx.create_primary(Hierarchy::Owner, public, None, None, None, None)
        })?;
        self.flush_transient().ok();

        Ok(PrimaryKeyContext {
            ctx: PkCtx { ctx: self.ctx, key },
            state: PrimaryKey,
        })
    }

    /// Marshalled public area of the endorsement key.
    pub fn endorsement_public(mut self) -> Result<Vec<u8>> {
        let key = self.ctx.execute_with_nullauth_session(|ctx| {
            ek::create_ek_object(ctx, AsymmetricAlgorithm::Rsa, None)
        })?;
        let public = self.ctx.read_public(key);
        self.ctx.flush_context(key.into()).ok();
        let (public, _name, _qualified_name) = public?;
        Ok(public.marshall()?)
    }
}

impl PrimaryKeyContext {
    pub fn with_pcr_policy(
        mut self,
        pcr_selection_list: &PcrSelectionList,
    ) -> Result<PcrPolicyContext> {
        let session = self.make_session(SessionType::Trial)?;
        let digest = self.pcr_digest(pcr_selection_list)?;

        self.ctx
            .policy_pcr(session.try_into()?, digest, pcr_selection_list.clone())?;
        let policy_digest = self.ctx.policy_get_digest(session.try_into()?)?;
        self.ctx.flush_session(session)?;

        Ok(PcrPolicyContext {
            ctx: self.ctx,
            state: PcrPolicy { policy_digest },
        })
    }
}

impl PcrPolicyContext {
    pub fn seal(&mut self, data: SensitiveData, handle: PersistentTpmHandle) -> Result<&mut Self> {
        let key = self.ctx.key;

        let object_attributes = ObjectAttributes::builder()
            .with_fixed_tpm(true)
            .with_fixed_parent(true)
            .build()?;

        // sealed data objects carry no scheme, see tpm2_create(1)
        let public = Public::builder()
            .with_public_algorithm(PublicAlgorithm::KeyedHash)
            .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
            .with_object_attributes(object_attributes)
            .with_auth_policy(self.state.policy_digest.clone())
            .with_keyed_hash_parameters(PublicKeyedHashParameters::new(KeyedHashScheme::Null))
            .with_keyed_hash_unique_identifier(Digest::default())
            .build()?;

        self.evict_persistent(handle);

        self.ctx
            .execute_with_session(Some(AuthSession::Password), |ctx| {
                let CreateKeyResult {
                    out_private,
                    out_public,
                    ..
                } = ctx.create(key, public, None, Some(data), None, None)?;
                let transient = ctx.load(key, out_private, out_public)?.into();
                let mut persistent =
                    ctx.evict_control(Provision::Owner, transient, Persistent::Persistent(handle))?;
                ctx.flush_context(transient)?;
                ctx.tr_close(&mut persistent)?;
                Ok::<(), TpmError>(())
            })?;
        Ok(self)
    }
}

impl PcrAuthedContext {
    pub fn unseal(mut self, handle: PersistentTpmHandle) -> Result<SensitiveData> {
        let object_handle = self
            .ctx
            .execute_without_session(|ctx| ctx.tr_from_tpm_public(handle.into()))?;
        let session = self.ctx.session;
        let data = self
            .ctx
            .execute_with_session(Some(session), |ctx| ctx.unseal(object_handle))?;
        Ok(data)
    }
}

static CONTEXT: OnceCell<Mutex<tss_esapi::Context>> = OnceCell::new();

pub fn get_context() -> Result<InitialContext> {
    let context = CONTEXT.get_or_try_init(|| {
        let conf = TctiNameConf::from_environment_variable()?;
        tracing::debug!(config = ?conf, "TCTI config");
        Ok::<_, TpmError>(Mutex::new(tss_esapi::Context::new(conf)?))
    })?;
    let mut ctx = context.lock().map_err(|_| TpmError::Poisoned)?;
    ctx.startup(StartupType::Clear)?;
    let mut ctx = Ctx {
        ctx,
        state: Initial,
    };
    ctx.flush_transient()?;
    Ok(ctx)
}

pub fn get_pcr_digest(pcr_selection_list: &PcrSelectionList) -> Result<Digest> {
    get_context()?.pcr_digest(pcr_selection_list)
}

/// Prover bound to this machine's endorsement key.
pub fn endorsement_prover() -> Result<EkDigestProver> {
    Ok(EkDigestProver::new(get_context()?.endorsement_public()?))
}

/// Passphrase sealed at a persistent handle under a PCR policy.
pub struct TpmSealStore {
    handle: PersistentTpmHandle,
    pcrs: PcrSelectionList,
}

impl TpmSealStore {
    pub fn new(handle: u32, pcrs: &str) -> Result<Self> {
        Ok(Self {
            handle: PersistentTpmHandle::new(handle)?,
            pcrs: pcr::parse_pcr_selection_list(pcrs)?,
        })
    }
}

impl SealStore for TpmSealStore {
    fn unseal(&mut self) -> seal::Result<Zeroizing<Vec<u8>>> {
        let data = get_context()?.pcr_auth(&self.pcrs)?.unseal(self.handle)?;
        Ok(Zeroizing::new(data.value().to_vec()))
    }

    fn seal(&mut self, data: &[u8]) -> seal::Result<()> {
        let data = SensitiveData::try_from(data.to_vec()).map_err(TpmError::from)?;
        get_context()?
            .create_primary()?
            .with_pcr_policy(&self.pcrs)?
            .seal(data, self.handle)?;
        let handle: u32 = self.handle.into();
        tracing::info!("sealed passphrase at {:#10x}", handle);
        Ok(())
    }
}
