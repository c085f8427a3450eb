//! RA-TLS attestation provider
//!
//! The attestation and verification libraries are deployment-specific, so
//! they are loaded dynamically and isolated behind [`AttestationProvider`]:
//! - `server_credentials` produces a fresh RSA key and an X.509 DER
//!   certificate embedding an enclave quote, for the TLS listener;
//! - `verify_peer` checks a peer certificate's embedded quote and compares
//!   its `mrenclave`/`mrsigner` against the expected values. ISV product
//!   id and SVN are ignored.
//!
//! Quote-generation and verification initialization are both idempotent.

use crate::error::{Error, Result};
use once_cell::sync::OnceCell;
use std::os::raw::{c_char, c_int};
use tracing::{debug, error, info, warn};

/// SGX-specific file describing the attestation flavor of this enclave.
const ATTESTATION_TYPE_PATH: &str = "/dev/attestation/attestation_type";

const ATTEST_LIB: &str = "libra_tls_attest.so";
const VERIFY_LIB: &str = "libra_tls_verify_dcap.so";
const URTS_LIB: &str = "libsgx_urts.so";

/// Expected enclave measurements, loaded once from config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Measurements {
    pub mrenclave: [u8; 32],
    pub mrsigner: [u8; 32],
}

impl Measurements {
    /// Decodes the two 32-byte measurements from hex config values.
    pub fn from_hex(mrenclave: &str, mrsigner: &str) -> Result<Self> {
        Ok(Self {
            mrenclave: decode_measurement("mrenclave", mrenclave)?,
            mrsigner: decode_measurement("mrsigner", mrsigner)?,
        })
    }

    /// Byte-for-byte comparison against a received quote's measurements.
    pub fn matches(&self, mrenclave: &[u8], mrsigner: &[u8]) -> bool {
        mrenclave == self.mrenclave && mrsigner == self.mrsigner
    }
}

fn decode_measurement(name: &str, hex_value: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hex_value.trim())
        .map_err(|e| Error::Config(format!("{} is not valid hex: {}", name, e)))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| Error::Config(format!("{} must be 32 bytes, got {}", name, bytes.len())))
}

/// Fresh key and certificate for the RA-TLS listener, both DER encoded.
#[derive(Debug)]
pub struct ServerCredentials {
    pub cert_der: Vec<u8>,
    pub key_der: Vec<u8>,
}

/// Capability consumed by the transport layer for RA-TLS.
pub trait AttestationProvider: Send + Sync {
    /// Creates the listener's key and quote-embedding certificate.
    fn server_credentials(&self) -> Result<ServerCredentials>;

    /// Verifies one peer certificate in DER form. `Ok(())` accepts the
    /// handshake step; any error rejects it.
    fn verify_peer(&self, cert_der: &[u8]) -> Result<()>;
}

/// Expected measurements for the verification callback.
///
/// The measurement callback crosses a C ABI boundary and cannot carry a
/// context pointer, so the expected values live in a write-once cell set
/// during verification init.
static EXPECTED: OnceCell<Measurements> = OnceCell::new();

type CreateKeyAndCrtFn =
    unsafe extern "C" fn(*mut *mut u8, *mut usize, *mut *mut u8, *mut usize) -> c_int;
type VerifyCallbackDerFn = unsafe extern "C" fn(*mut u8, usize) -> c_int;
type MeasurementCb =
    extern "C" fn(*const c_char, *const c_char, *const c_char, *const c_char) -> c_int;
type SetMeasurementCallbackFn = unsafe extern "C" fn(Option<MeasurementCb>);

/// Compares the quote's measurements against the expected values.
///
/// Returns 0 to accept, non-zero to reject. Called by the verification
/// library once per verified quote.
extern "C" fn measurement_callback(
    mrenclave: *const c_char,
    mrsigner: *const c_char,
    _isv_prod_id: *const c_char,
    _isv_svn: *const c_char,
) -> c_int {
    if mrenclave.is_null() || mrsigner.is_null() {
        error!("Quote verification passed null measurements");
        return -1;
    }

    let (mrenclave, mrsigner) = unsafe {
        (
            std::slice::from_raw_parts(mrenclave as *const u8, 32),
            std::slice::from_raw_parts(mrsigner as *const u8, 32),
        )
    };

    debug!(
        mrenclave = %hex::encode(mrenclave),
        mrsigner = %hex::encode(mrsigner),
        "Receiving quote measurements"
    );

    let Some(expected) = EXPECTED.get() else {
        error!("Measurement callback invoked before verification init");
        return -1;
    };

    if mrenclave != expected.mrenclave {
        error!("mrenclave mismatch");
        return -1;
    }
    if mrsigner != expected.mrsigner {
        error!("mrsigner mismatch");
        return -1;
    }

    0
}

/// Provider backed by the Gramine RA-TLS libraries, loaded at runtime.
pub struct GramineAttestation {
    expected: Measurements,
    attest_lib: OnceCell<libloading::Library>,
    verify_lib: OnceCell<libloading::Library>,
}

impl GramineAttestation {
    pub fn new(expected: Measurements) -> Self {
        Self {
            expected,
            attest_lib: OnceCell::new(),
            verify_lib: OnceCell::new(),
        }
    }

    /// Loads the attestation library, checking the local attestation device.
    fn init_quote_generation(&self) -> Result<&libloading::Library> {
        self.attest_lib.get_or_try_init(|| {
            match std::fs::read_to_string(ATTESTATION_TYPE_PATH) {
                Ok(attestation_type) => {
                    info!(
                        attestation_type = %attestation_type.trim(),
                        "Creating RA-TLS server credentials"
                    );
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        "Cannot read {}; the attestation device may be missing",
                        ATTESTATION_TYPE_PATH
                    );
                }
            }

            unsafe { libloading::Library::new(ATTEST_LIB) }.map_err(|e| {
                Error::Attestation(format!("cannot load {}: {}", ATTEST_LIB, e))
            })
        })
    }

    /// Loads the DCAP verification library and registers the measurement
    /// callback.
    fn init_verification(&self) -> Result<&libloading::Library> {
        self.verify_lib.get_or_try_init(|| {
            // The DCAP library resolves symbols from the urts library at
            // load time, so it must be opened RTLD_GLOBAL first.
            use libloading::os::unix::{Library as UnixLibrary, RTLD_GLOBAL, RTLD_NOW};
            let urts = unsafe { UnixLibrary::open(Some(URTS_LIB), RTLD_NOW | RTLD_GLOBAL) }
                .map_err(|e| {
                    Error::Attestation(format!("cannot load {}: {}", URTS_LIB, e))
                })?;
            std::mem::forget(urts);

            let lib = unsafe { libloading::Library::new(VERIFY_LIB) }.map_err(|e| {
                Error::Attestation(format!("cannot load {}: {}", VERIFY_LIB, e))
            })?;

            // Re-init with identical values is a no-op; different values
            // would silently change what the registered callback enforces.
            if EXPECTED.set(self.expected).is_err() && EXPECTED.get() != Some(&self.expected) {
                return Err(Error::Attestation(
                    "verification already initialized with different expected measurements"
                        .into(),
                ));
            }

            unsafe {
                let set_callback: libloading::Symbol<SetMeasurementCallbackFn> =
                    lib.get(b"ra_tls_set_measurement_callback\0").map_err(|e| {
                        Error::Attestation(format!(
                            "missing ra_tls_set_measurement_callback: {}",
                            e
                        ))
                    })?;
                set_callback(Some(measurement_callback));
            }

            debug!("Quote verification initialized");
            Ok(lib)
        })
    }
}

impl AttestationProvider for GramineAttestation {
    fn server_credentials(&self) -> Result<ServerCredentials> {
        let lib = self.init_quote_generation()?;

        let mut der_key: *mut u8 = std::ptr::null_mut();
        let mut der_key_size: usize = 0;
        let mut der_crt: *mut u8 = std::ptr::null_mut();
        let mut der_crt_size: usize = 0;

        let ret = unsafe {
            let create: libloading::Symbol<CreateKeyAndCrtFn> =
                lib.get(b"ra_tls_create_key_and_crt_der\0").map_err(|e| {
                    Error::Attestation(format!("missing ra_tls_create_key_and_crt_der: {}", e))
                })?;
            create(
                &mut der_key,
                &mut der_key_size,
                &mut der_crt,
                &mut der_crt_size,
            )
        };
        if ret != 0 {
            return Err(Error::Attestation(format!(
                "ra_tls_create_key_and_crt_der returned {}",
                ret
            )));
        }
        if der_key.is_null() || der_crt.is_null() {
            return Err(Error::Attestation(
                "attestation library returned null credentials".into(),
            ));
        }

        let credentials = unsafe {
            ServerCredentials {
                key_der: std::slice::from_raw_parts(der_key, der_key_size).to_vec(),
                cert_der: std::slice::from_raw_parts(der_crt, der_crt_size).to_vec(),
            }
        };

        debug!(
            cert_len = credentials.cert_der.len(),
            "RA-TLS server credentials created"
        );
        Ok(credentials)
    }

    fn verify_peer(&self, cert_der: &[u8]) -> Result<()> {
        let lib = self.init_verification()?;

        let mut der = cert_der.to_vec();
        let ret = unsafe {
            let verify: libloading::Symbol<VerifyCallbackDerFn> =
                lib.get(b"ra_tls_verify_callback_der\0").map_err(|e| {
                    Error::Attestation(format!("missing ra_tls_verify_callback_der: {}", e))
                })?;
            verify(der.as_mut_ptr(), der.len())
        };

        if ret != 0 {
            return Err(Error::Attestation(format!(
                "quote verification rejected peer certificate ({})",
                ret
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENCLAVE_HEX: &str =
        "0000000000000000000000000000000000000000000000000000000000000001";
    const SIGNER_HEX: &str =
        "0000000000000000000000000000000000000000000000000000000000000002";

    #[test]
    fn test_measurements_from_hex() {
        let m = Measurements::from_hex(ENCLAVE_HEX, SIGNER_HEX).expect("decode");
        assert_eq!(m.mrenclave[31], 1);
        assert_eq!(m.mrsigner[31], 2);
    }

    #[test]
    fn test_measurements_rejects_short_hex() {
        assert!(Measurements::from_hex("aabb", SIGNER_HEX).is_err());
    }

    #[test]
    fn test_measurements_rejects_non_hex() {
        assert!(Measurements::from_hex(&"zz".repeat(32), SIGNER_HEX).is_err());
    }

    #[test]
    fn test_measurement_comparison() {
        let m = Measurements::from_hex(ENCLAVE_HEX, SIGNER_HEX).expect("decode");
        assert!(m.matches(&m.mrenclave, &m.mrsigner));

        let mut other = m.mrenclave;
        other[0] ^= 0xff;
        assert!(!m.matches(&other, &m.mrsigner));
        assert!(!m.matches(&m.mrenclave, &other));
    }

    #[test]
    fn test_missing_attest_lib_is_attestation_error() {
        let provider = GramineAttestation::new(
            Measurements::from_hex(ENCLAVE_HEX, SIGNER_HEX).expect("decode"),
        );
        // No Gramine runtime in the test environment.
        let err = provider.server_credentials().expect_err("should fail");
        assert!(matches!(err, Error::Attestation(_)));
    }
}
