use anyhow::Result;
use dashmap::DashMap;
use regex::Regex;
use reqwest::Client;
use serde_json::json;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const WINDOW: Duration = Duration::from_secs(60);
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(5);
/// Risk score at which pattern matches alone block a request.
const BLOCK_SCORE: u32 = 10;

/// Scanner user agents blocked outright (prefix of the token before `/`).
const SCANNER_AGENTS: &[&str] = &[
    "sqlmap", "nikto", "dirb", "gobuster", "wfuzz", "masscan", "nmap", "zap", "burp", "acunetix",
    "nessus", "openvas",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    fn weight(&self) -> u32 {
        match self {
            Self::Low => 1,
            Self::Medium => 3,
            Self::High => 5,
            Self::Critical => 10,
        }
    }
}

struct ThreatPattern {
    label: &'static str,
    severity: Severity,
    regex: Regex,
}

/// Verdict for one request. Only `blocked = true` affects the response.
#[derive(Debug, Clone)]
pub struct ThreatVerdict {
    pub blocked: bool,
    pub score: u32,
    pub reasons: Vec<String>,
}

impl ThreatVerdict {
    fn clean() -> Self {
        Self {
            blocked: false,
            score: 0,
            reasons: Vec::new(),
        }
    }
}

/// Pattern-based detection of abusive scans, with a per-IP request ceiling.
///
/// Every internal failure means "allow": this layer protects the service, it
/// must never take it down.
pub struct ThreatDetector {
    max_requests_per_minute: usize,
    webhook_url: Option<String>,
    windows: DashMap<String, Vec<Instant>>,
    patterns: Vec<ThreatPattern>,
    http: Client,
}

impl ThreatDetector {
    pub fn new(max_requests_per_minute: usize, webhook_url: Option<String>) -> Result<Self> {
        let patterns = vec![
            pattern("vuln_scan_path", Severity::High,
                r"(?i)(/wp-admin|/wp-login|/phpmyadmin|/\.env|\.git/|/etc/passwd|/admin/config|/cgi-bin/)")?,
            pattern("sql_injection", Severity::Critical,
                r"(?i)(union\s+select|or\s+1\s*=\s*1|information_schema|sleep\s*\(|'\s*--)")?,
            pattern("path_traversal", Severity::High, r"\.\./")?,
            pattern("xss_marker", Severity::High, r"(?i)(<script|javascript:|onerror\s*=)")?,
            pattern("shell_marker", Severity::Medium, r"(?i)(;\s*wget\s|;\s*curl\s|\|\s*bash)")?,
        ];

        Ok(Self {
            max_requests_per_minute,
            webhook_url,
            windows: DashMap::new(),
            patterns,
            http: Client::builder()
                .timeout(WEBHOOK_TIMEOUT)
                .build()
                .unwrap_or_else(|_| Client::new()),
        })
    }

    /// Score a request. Never fails: internal errors collapse to "allow".
    pub fn evaluate(&self, ip: &str, method: &str, url: &str, user_agent: &str) -> ThreatVerdict {
        match self.evaluate_inner(ip, method, url, user_agent) {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!("Threat evaluation failed, allowing request: {}", e);
                ThreatVerdict::clean()
            }
        }
    }

    fn evaluate_inner(
        &self,
        ip: &str,
        method: &str,
        url: &str,
        user_agent: &str,
    ) -> Result<ThreatVerdict> {
        let mut verdict = ThreatVerdict::clean();

        if is_scanner_agent(user_agent) {
            verdict.blocked = true;
            verdict.score += Severity::Critical.weight();
            verdict.reasons.push(format!("scanner user-agent: {}", user_agent));
        }

        if self.over_rate_ceiling(ip) {
            verdict.blocked = true;
            verdict.score += Severity::High.weight();
            verdict
                .reasons
                .push(format!("over {} requests/minute", self.max_requests_per_minute));
        }

        let mut critical_hit = false;
        for p in &self.patterns {
            if p.regex.is_match(url) || p.regex.is_match(user_agent) {
                verdict.score += p.severity.weight();
                verdict.reasons.push(p.label.to_string());
                critical_hit |= p.severity == Severity::Critical;
            }
        }

        if verdict.score >= BLOCK_SCORE {
            verdict.blocked = true;
        }

        if critical_hit {
            self.dispatch_alert(ip, method, url, user_agent, &verdict);
        }

        if verdict.blocked {
            warn!(
                ip,
                score = verdict.score,
                reasons = ?verdict.reasons,
                "Blocked suspicious request"
            );
        }

        Ok(verdict)
    }

    /// Sliding 60 s window; returns true once the ceiling is exceeded.
    fn over_rate_ceiling(&self, ip: &str) -> bool {
        let now = Instant::now();
        let mut entry = self.windows.entry(ip.to_string()).or_default();
        entry.retain(|t| now.duration_since(*t) < WINDOW);
        entry.push(now);
        entry.len() > self.max_requests_per_minute
    }

    /// Fire-and-forget webhook alert for critical pattern hits.
    fn dispatch_alert(&self, ip: &str, method: &str, url: &str, user_agent: &str, verdict: &ThreatVerdict) {
        let Some(webhook) = self.webhook_url.clone() else {
            return;
        };

        let payload = json!({
            "ip": ip,
            "method": method,
            "url": url,
            "user_agent": user_agent,
            "score": verdict.score,
            "reasons": verdict.reasons,
        });
        let client = self.http.clone();

        tokio::spawn(async move {
            match client.post(&webhook).json(&payload).send().await {
                Ok(resp) => debug!("Threat alert delivered ({})", resp.status()),
                Err(e) => warn!("Threat alert webhook failed: {}", e),
            }
        });
    }

    /// Drop idle window entries. Called from the hourly sweep task.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.windows.retain(|_, times| {
            times.retain(|t| now.duration_since(*t) < WINDOW);
            !times.is_empty()
        });
    }

    #[cfg(test)]
    fn tracked_ips(&self) -> usize {
        self.windows.len()
    }
}

fn pattern(label: &'static str, severity: Severity, re: &str) -> Result<ThreatPattern> {
    Ok(ThreatPattern {
        label,
        severity,
        regex: Regex::new(re)?,
    })
}

/// Case-insensitive prefix match on the product token before `/`.
fn is_scanner_agent(user_agent: &str) -> bool {
    let token = user_agent
        .split('/')
        .next()
        .unwrap_or("")
        .trim()
        .to_lowercase();
    SCANNER_AGENTS.iter().any(|s| token.starts_with(s))
}
