use std::{
    collections::HashMap,
    fmt::Write,
    future::Future,
    sync::{Arc, Mutex},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use rustls::{
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
};
use tokio::time::{Instant, sleep};
use tracing::debug;

// Certificates issued longer ago than this are never delayed.
const FRESH_CERTIFICATE_AGE: Duration = Duration::from_secs(2 * 60 * 60);
const FIRST_USE_DELAY: Duration = Duration::from_secs(2);
// Requests this soon after the first use are delayed again.
const REPEAT_WINDOW: Duration = Duration::from_secs(3);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

// The parts of a leaf certificate that drive delays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CertTiming {
    pub(crate) serial: String,
    pub(crate) not_before: SystemTime,
    pub(crate) not_after: SystemTime,
}

impl CertTiming {
    pub(crate) fn from_der(der: &[u8]) -> Option<Self> {
        let (_, cert) = x509_parser::parse_x509_certificate(der).ok()?;
        let mut serial = String::with_capacity(cert.raw_serial().len() * 2);
        for byte in cert.raw_serial() {
            let _ = write!(serial, "{byte:02x}");
        }
        Some(CertTiming {
            serial,
            not_before: asn1_to_system_time(cert.validity().not_before.timestamp()),
            not_after: asn1_to_system_time(cert.validity().not_after.timestamp()),
        })
    }

    fn is_fresh(&self, now: SystemTime) -> bool {
        match now.duration_since(self.not_before) {
            Ok(age) => age < FRESH_CERTIFICATE_AGE,
            // Not valid yet, so it must be brand new.
            Err(_) => true,
        }
    }
}

fn asn1_to_system_time(timestamp: i64) -> SystemTime {
    if timestamp >= 0 {
        UNIX_EPOCH + Duration::from_secs(timestamp as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs(timestamp.unsigned_abs())
    }
}

#[derive(Debug)]
struct CertTimeEntry {
    first_seen: Instant,
    expire: SystemTime,
}

#[derive(Debug)]
struct DelayState {
    entries: HashMap<String, CertTimeEntry>,
    next_cleanup: Instant,
}

impl DelayState {
    // Remove entries for expired certificates, at most once per cleanup interval.
    fn sweep(&mut self, now: Instant, wall_clock: SystemTime) {
        if now < self.next_cleanup {
            return;
        }
        self.next_cleanup = now + CLEANUP_INTERVAL;
        self.entries.retain(|_, entry| entry.expire > wall_clock);
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Hold {
    None,
    FirstUse,
    Repeat,
}

// Wraps a certificate resolver, delaying the first uses of recently issued certificates.
//
// Other servers sharing the certificate store may not see a new certificate yet, so clients
// that race to them right after issuance would get a different one.
#[derive(Debug)]
pub(crate) struct CertificateDelayer<R> {
    inner: R,
    state: Mutex<DelayState>,
}

impl<R: ResolvesServerCert> CertificateDelayer<R> {
    pub(crate) fn new(inner: R) -> Self {
        CertificateDelayer {
            inner,
            state: Mutex::new(DelayState {
                entries: HashMap::new(),
                next_cleanup: Instant::now() + CLEANUP_INTERVAL,
            }),
        }
    }

    pub(crate) fn inner(&self) -> &R {
        &self.inner
    }

    // Resolve a certificate for the Client Hello, then wait as long as its age requires.
    pub(crate) fn get_certificate(
        &self,
        client_hello: ClientHello<'_>,
    ) -> impl Future<Output = Option<Arc<CertifiedKey>>> + Send + '_ {
        let key = self.inner.resolve(client_hello);
        async move {
            let key = key?;
            if let Some(timing) = key
                .end_entity_cert()
                .ok()
                .and_then(|der| CertTiming::from_der(der))
            {
                self.delay(&timing).await;
            }
            Some(key)
        }
    }

    pub(crate) async fn delay(&self, timing: &CertTiming) {
        let wall_clock = SystemTime::now();
        if !timing.is_fresh(wall_clock) {
            return;
        }
        // The lock is never held across a sleep.
        let hold = {
            let now = Instant::now();
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            state.sweep(now, wall_clock);
            match state.entries.get(&timing.serial) {
                None => Hold::FirstUse,
                Some(entry) if now.duration_since(entry.first_seen) < REPEAT_WINDOW => {
                    Hold::Repeat
                }
                Some(_) => Hold::None,
            }
        };
        match hold {
            Hold::None => (),
            Hold::FirstUse => {
                debug!(serial = %timing.serial, "Delaying first use of new certificate.");
                sleep(FIRST_USE_DELAY).await;
                if let Ok(mut state) = self.state.lock() {
                    state
                        .entries
                        .entry(timing.serial.clone())
                        .or_insert_with(|| CertTimeEntry {
                            first_seen: Instant::now(),
                            expire: timing.not_after,
                        });
                }
            }
            Hold::Repeat => {
                debug!(serial = %timing.serial, "Delaying repeated use of new certificate.");
                sleep(FIRST_USE_DELAY).await;
            }
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.state.lock().map(|state| state.entries.len()).unwrap_or(0)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod certificate_delayer_tests {
    use std::{
        sync::Arc,
        time::{Duration, SystemTime},
    };

    use rcgen::{CertificateParams, KeyPair};
    use rustls::{
        pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer},
        server::{ClientHello, ResolvesServerCert},
        sign::CertifiedKey,
    };
    use tokio::time::Instant;

    use super::{CLEANUP_INTERVAL, CertTiming, CertificateDelayer};

    #[derive(Debug)]
    struct NoCertificate;

    impl ResolvesServerCert for NoCertificate {
        fn resolve(&self, _: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
            None
        }
    }

    fn fresh(serial: &str) -> CertTiming {
        let now = SystemTime::now();
        CertTiming {
            serial: serial.into(),
            not_before: now - Duration::from_secs(60),
            not_after: now + Duration::from_secs(90 * 24 * 60 * 60),
        }
    }

    async fn elapsed(delayer: &CertificateDelayer<NoCertificate>, timing: &CertTiming) -> Duration {
        let start = Instant::now();
        delayer.delay(timing).await;
        start.elapsed()
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn old_certificate_never_delays() {
        let delayer = CertificateDelayer::new(NoCertificate);
        let now = SystemTime::now();
        let old = CertTiming {
            serial: "01".into(),
            not_before: now - Duration::from_secs(3 * 60 * 60),
            not_after: now + Duration::from_secs(60 * 60),
        };
        for _ in 0..3 {
            assert_eq!(elapsed(&delayer, &old).await, Duration::ZERO);
        }
        assert_eq!(delayer.tracked(), 0);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn fresh_certificate_delays_first_and_second_use_only() {
        let delayer = CertificateDelayer::new(NoCertificate);
        let timing = fresh("0a1b");
        assert_eq!(elapsed(&delayer, &timing).await, Duration::from_secs(2));
        assert_eq!(delayer.tracked(), 1);
        // Still within 3 seconds of the first use.
        assert_eq!(elapsed(&delayer, &timing).await, Duration::from_secs(2));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(elapsed(&delayer, &timing).await, Duration::ZERO);
        assert_eq!(delayer.tracked(), 1);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn serials_are_tracked_separately() {
        let delayer = Arc::new(CertificateDelayer::new(NoCertificate));
        let start = Instant::now();
        let first = {
            let delayer = Arc::clone(&delayer);
            tokio::spawn(async move { delayer.delay(&fresh("aa")).await })
        };
        let second = {
            let delayer = Arc::clone(&delayer);
            tokio::spawn(async move { delayer.delay(&fresh("bb")).await })
        };
        first.await.unwrap();
        second.await.unwrap();
        // Both sleeps ran concurrently.
        assert_eq!(start.elapsed(), Duration::from_secs(2));
        assert_eq!(delayer.tracked(), 2);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn sweeps_expired_entries_hourly() {
        let delayer = CertificateDelayer::new(NoCertificate);
        let now = SystemTime::now();
        let expired = CertTiming {
            serial: "dead".into(),
            not_before: now - Duration::from_secs(60),
            not_after: now - Duration::from_secs(1),
        };
        delayer.delay(&expired).await;
        assert_eq!(delayer.tracked(), 1);
        // No sweep before the cleanup interval elapses.
        delayer.delay(&fresh("beef")).await;
        assert_eq!(delayer.tracked(), 2);
        tokio::time::sleep(CLEANUP_INTERVAL).await;
        delayer.delay(&fresh("cafe")).await;
        assert_eq!(delayer.tracked(), 2, "expired entry should be swept");
    }

    #[test]
    fn parses_certificate_timing() {
        let key_pair = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec!["a.example".into()]).unwrap();
        params.serial_number = Some(vec![0x01, 0xab].into());
        let cert = params.self_signed(&key_pair).unwrap();
        let timing = CertTiming::from_der(cert.der()).unwrap();
        assert_eq!(timing.serial, "01ab");
        // rcgen's default validity starts in 1975.
        assert!(!timing.is_fresh(SystemTime::now()));
        assert!(timing.not_after > timing.not_before);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn resolved_old_certificate_is_returned_without_delay() {
        #[derive(Debug)]
        struct Fixed(Arc<CertifiedKey>);

        impl ResolvesServerCert for Fixed {
            fn resolve(&self, _: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
                Some(Arc::clone(&self.0))
            }
        }

        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        let key_pair = KeyPair::generate().unwrap();
        let cert = CertificateParams::new(vec!["a.example".into()])
            .unwrap()
            .self_signed(&key_pair)
            .unwrap();
        let key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&PrivateKeyDer::Pkcs8(
            PrivatePkcs8KeyDer::from(key_pair.serialize_der()),
        ))
        .unwrap();
        let certified = Arc::new(CertifiedKey::new(
            vec![CertificateDer::from(cert.der().to_vec())],
            key,
        ));
        let delayer = CertificateDelayer::new(Fixed(Arc::clone(&certified)));
        let timing = CertTiming::from_der(&certified.cert[0]).unwrap();
        let start = Instant::now();
        delayer.delay(&timing).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(Arc::ptr_eq(&delayer.inner().0, &certified));
    }
}
