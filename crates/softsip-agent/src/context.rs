use rand::Rng;
use smol_str::SmolStr;
use softsip_core::SipMessage;
use softsip_digest::Challenge;
use tracing::warn;

/// Per-dialog identity and authentication state.
///
/// Both the registration and every call own one: a Call-ID, a From tag,
/// a CSeq counter starting at 1, and the last digest challenges answered
/// for the server and an intermediate proxy.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub id: SmolStr,
    pub tag: SmolStr,
    pub cseq: u32,
    pub challenge: Option<Challenge>,
    pub proxy_challenge: Option<Challenge>,
}

impl CallContext {
    pub fn new() -> CallContext {
        let mut rng = rand::thread_rng();
        CallContext {
            id: random_hex(&mut rng, 32),
            tag: random_hex(&mut rng, 8),
            cseq: 1,
            challenge: None,
            proxy_challenge: None,
        }
    }

    /// Returns the current sequence number and advances the counter.
    pub fn next_cseq(&mut self) -> u32 {
        let cseq = self.cseq;
        self.cseq += 1;
        cseq
    }

    /// Drops any stored challenges, forcing fresh authentication.
    pub fn clear_challenges(&mut self) {
        self.challenge = None;
        self.proxy_challenge = None;
    }

    /// Absorbs the challenge carried by a 401 or 407 response.
    ///
    /// Returns `false` when the scheme is not Digest or when the server
    /// repeated the realm and nonce we already answered, which means the
    /// credentials were rejected and retrying would loop.
    pub fn handle_authentication(&mut self, response: &SipMessage) -> bool {
        let proxy = response.status_code() == Some(407);
        let header = if proxy {
            "Proxy-Authenticate"
        } else {
            "WWW-Authenticate"
        };
        let Some(value) = response.header(header) else {
            return false;
        };
        let Some(challenge) = Challenge::parse_header(&value) else {
            warn!("unsupported authentication method");
            return false;
        };
        let slot = if proxy {
            &mut self.proxy_challenge
        } else {
            &mut self.challenge
        };
        if let Some(last) = slot {
            if last.realm() == challenge.realm() && last.nonce() == challenge.nonce() {
                warn!("authentication failed");
                return false;
            }
        }
        *slot = Some(challenge);
        true
    }
}

impl Default for CallContext {
    fn default() -> Self {
        CallContext::new()
    }
}

fn random_hex(rng: &mut impl Rng, len: usize) -> SmolStr {
    let token: String = (0..len)
        .map(|_| char::from_digit(rng.gen_range(0..16u32), 16).unwrap_or('0'))
        .collect();
    SmolStr::new(token)
}
