use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use base64::Engine;
use tokio::sync::Notify;
use tokio::time::Duration;

use crate::core::errors::CoreError;

const HTTPS_RR_TYPE: u16 = 65;
const SVCB_PARAM_ECH: u16 = 5;
const DOH_TIMEOUT: Duration = Duration::from_secs(3);

/// Single-flight-by-domain cache of resolved ECH config lists (§4.E, P9).
/// Grounded on the `InFlight`/`StatusCache::get_or_load` pattern from the
/// teacher's Minecraft-status cache: a placeholder with a one-shot
/// `Notify` is installed before the network request starts, so concurrent
/// callers for the same domain share one DoH request and one result.
struct InFlight {
    done: AtomicBool,
    notify: Notify,
    result: Mutex<Option<Result<Arc<Vec<u8>>, String>>>,
}

impl InFlight {
    fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
            notify: Notify::new(),
            result: Mutex::new(None),
        }
    }

    fn finish(&self, result: Result<Arc<Vec<u8>>, String>) {
        *self.result.lock().expect("ech inflight lock poisoned") = Some(result);
        self.done.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    async fn wait(&self) -> Result<Arc<Vec<u8>>, String> {
        loop {
            if self.done.load(Ordering::Acquire) {
                return self.result.lock().expect("ech inflight lock poisoned").clone().expect("result set");
            }
            self.notify.notified().await;
        }
    }
}

struct EchCache {
    ready: Mutex<HashMap<String, Arc<Vec<u8>>>>,
    inflight: Mutex<HashMap<String, Arc<InFlight>>>,
}

impl EchCache {
    fn new() -> Self {
        Self {
            ready: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }
}

fn cache() -> &'static EchCache {
    static CACHE: OnceLock<EchCache> = OnceLock::new();
    CACHE.get_or_init(EchCache::new)
}

/// Resolves the ECH config list for `domain` via DoH at `doh_url`,
/// deduplicating concurrent lookups for the same domain and caching
/// successful results for the process lifetime (§3 "ECH cache": entries
/// never expire; a failed lookup is not cached so it can be retried).
pub async fn resolve(doh_url: &str, domain: &str) -> Result<Arc<Vec<u8>>, CoreError> {
    let c = cache();

    if let Some(hit) = c.ready.lock().expect("ech cache lock poisoned").get(domain).cloned() {
        return Ok(hit);
    }

    // The single critical section below both looks up and, if absent,
    // installs the placeholder, so exactly one caller ever observes
    // `is_owner == true` for a given domain — ownership is decided at
    // insertion time, not by a second racy re-check afterwards.
    let (inflight, is_owner) = {
        let mut table = c.inflight.lock().expect("ech inflight table poisoned");
        if let Some(existing) = table.get(domain).cloned() {
            (existing, false)
        } else {
            let fresh = Arc::new(InFlight::new());
            table.insert(domain.to_string(), fresh.clone());
            (fresh, true)
        }
    };

    if is_owner {
        let outcome = fetch_ech_config(doh_url, domain).await;
        match &outcome {
            Ok(bytes) => {
                c.ready.lock().expect("ech cache lock poisoned").insert(domain.to_string(), bytes.clone());
            }
            Err(_) => {
                // Do not cache failures; remove the placeholder so the
                // next caller retries from scratch.
            }
        }
        c.inflight.lock().expect("ech inflight table poisoned").remove(domain);
        inflight.finish(outcome.clone());
        outcome.map_err(|e| CoreError::dns(e))
    } else {
        inflight.wait().await.map_err(|e| CoreError::dns(e))
    }
}

async fn fetch_ech_config(doh_url: &str, domain: &str) -> Result<Arc<Vec<u8>>, String> {
    let query = build_https_query(domain);
    let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(query);
    let url = format!("{doh_url}?dns={encoded}");

    let client = reqwest::Client::builder()
        .timeout(DOH_TIMEOUT)
        .build()
        .map_err(|e| format!("doh client: {e}"))?;

    let resp = client
        .get(&url)
        .header("accept", "application/dns-message")
        .send()
        .await
        .map_err(|e| format!("doh request: {e}"))?;

    if !resp.status().is_success() {
        return Err(format!("doh status: {}", resp.status()));
    }

    let body = resp.bytes().await.map_err(|e| format!("doh body: {e}"))?;
    parse_ech_from_answer(&body).map(Arc::new).ok_or_else(|| "no ech config in answer".to_string())
}

/// Builds a minimal DNS query for QTYPE=HTTPS over `domain`.
fn build_https_query(domain: &str) -> Vec<u8> {
    let mut msg = Vec::new();
    msg.extend_from_slice(&0x1234u16.to_be_bytes()); // id
    msg.extend_from_slice(&0x0100u16.to_be_bytes()); // flags: recursion desired
    msg.extend_from_slice(&1u16.to_be_bytes()); // qdcount
    msg.extend_from_slice(&0u16.to_be_bytes()); // ancount
    msg.extend_from_slice(&0u16.to_be_bytes()); // nscount
    msg.extend_from_slice(&0u16.to_be_bytes()); // arcount

    for label in domain.split('.') {
        if label.is_empty() {
            continue;
        }
        msg.push(label.len() as u8);
        msg.extend_from_slice(label.as_bytes());
    }
    msg.push(0);
    msg.extend_from_slice(&HTTPS_RR_TYPE.to_be_bytes());
    msg.extend_from_slice(&1u16.to_be_bytes()); // class IN
    msg
}

/// Parses a DNS response for the first HTTPS RR's SvcParam #5 (`ech`).
/// Minimal parser: enough to extract the one value this resolver needs,
/// not a general-purpose DNS message decoder.
fn parse_ech_from_answer(body: &[u8]) -> Option<Vec<u8>> {
    if body.len() < 12 {
        return None;
    }
    let qdcount = u16::from_be_bytes([body[4], body[5]]) as usize;
    let ancount = u16::from_be_bytes([body[6], body[7]]) as usize;

    let mut pos = 12;
    for _ in 0..qdcount {
        pos = skip_name(body, pos)?;
        pos += 4; // qtype + qclass
    }

    for _ in 0..ancount {
        pos = skip_name(body, pos)?;
        let rtype = u16::from_be_bytes([*body.get(pos)?, *body.get(pos + 1)?]);
        pos += 2 + 2 + 4; // type, class, ttl
        let rdlength = u16::from_be_bytes([*body.get(pos)?, *body.get(pos + 1)?]) as usize;
        pos += 2;
        let rdata = body.get(pos..pos + rdlength)?;
        pos += rdlength;

        if rtype == HTTPS_RR_TYPE {
            if let Some(ech) = parse_svcb_rdata(rdata) {
                return Some(ech);
            }
        }
    }
    None
}

fn parse_svcb_rdata(rdata: &[u8]) -> Option<Vec<u8>> {
    if rdata.len() < 3 {
        return None;
    }
    let mut pos = 2; // skip SvcPriority
    pos = skip_name(rdata, pos)?; // TargetName

    while pos + 4 <= rdata.len() {
        let key = u16::from_be_bytes([rdata[pos], rdata[pos + 1]]);
        let len = u16::from_be_bytes([rdata[pos + 2], rdata[pos + 3]]) as usize;
        pos += 4;
        let value = rdata.get(pos..pos + len)?;
        pos += len;
        if key == SVCB_PARAM_ECH {
            return Some(value.to_vec());
        }
    }
    None
}

fn skip_name(buf: &[u8], mut pos: usize) -> Option<usize> {
    loop {
        let len = *buf.get(pos)? as usize;
        if len == 0 {
            return Some(pos + 1);
        }
        if len & 0xC0 == 0xC0 {
            return Some(pos + 2); // compression pointer
        }
        pos += 1 + len;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn https_query_encodes_domain_labels() {
        let q = build_https_query("example.com");
        assert_eq!(&q[12..20], b"\x07example");
    }

    #[test]
    fn svcb_rdata_extracts_ech_param() {
        let mut rdata = vec![0u8, 1u8]; // priority
        rdata.push(0); // root target name
        rdata.extend_from_slice(&5u16.to_be_bytes()); // key=ech
        rdata.extend_from_slice(&3u16.to_be_bytes()); // len=3
        rdata.extend_from_slice(&[0xAA, 0xBB, 0xCC]);

        let ech = parse_svcb_rdata(&rdata).unwrap();
        assert_eq!(ech, vec![0xAA, 0xBB, 0xCC]);
    }
}
