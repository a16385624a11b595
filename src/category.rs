//! Domain categorization and alert derivation.
//!
//! A static, process-wide rule table maps domains to risk categories.
//! Categorization is a pure function over that table; it never touches the
//! store. Alerts are derived on demand by scanning a window of logged
//! queries against the table.

use std::collections::HashMap;

use serde::Serialize;

use crate::store::QueryRecord;

/// Three-level risk ranking attached to a category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    High,
    Medium,
    Low,
}

impl Severity {
    /// Sort rank: high first.
    pub const fn rank(self) -> u8 {
        match self {
            Self::High => 0,
            Self::Medium => 1,
            Self::Low => 2,
        }
    }
}

/// A single categorization rule set.
///
/// `domains` match exactly or as a suffix (`sub.pornhub.com` matches
/// `pornhub.com`); `keywords` match as substrings. Within a category,
/// domain rules are checked before keyword rules.
#[derive(Debug, Clone)]
pub struct Category {
    pub id: &'static str,
    pub label: &'static str,
    pub severity: Severity,
    pub domains: &'static [&'static str],
    pub keywords: &'static [&'static str],
}

/// Per-category counts for listing the rule set.
#[derive(Debug, Clone, Serialize)]
pub struct CategorySummary {
    pub id: &'static str,
    pub label: &'static str,
    pub severity: Severity,
    pub domain_count: usize,
    pub keyword_count: usize,
}

/// A flagged domain derived from the query log. Never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub domain: String,
    pub category: &'static str,
    pub label: &'static str,
    pub severity: Severity,
    pub source_ip: String,
    pub timestamp: String,
}

/// The immutable category table, built once at startup.
///
/// Categories are evaluated in declared order and the first match wins, so
/// ambiguous domains resolve deterministically.
#[derive(Debug, Clone)]
pub struct CategorySet {
    categories: Vec<Category>,
}

impl CategorySet {
    /// The built-in rule table.
    pub fn builtin() -> Self {
        Self {
            categories: BUILTIN.to_vec(),
        }
    }

    /// All categories in evaluation order.
    pub fn categories(&self) -> &[Category] {
        &self.categories
    }

    /// Id/label/severity plus rule counts for each category.
    pub fn summaries(&self) -> Vec<CategorySummary> {
        self.categories
            .iter()
            .map(|cat| CategorySummary {
                id: cat.id,
                label: cat.label,
                severity: cat.severity,
                domain_count: cat.domains.len(),
                keyword_count: cat.keywords.len(),
            })
            .collect()
    }

    /// Look up the category for a domain, if any.
    ///
    /// The domain is normalized (lowercased, trailing dot stripped), then
    /// each category is tested: exact-or-suffix against its domain rules
    /// first, then substring against its keywords. No match means the
    /// domain is uncategorized.
    pub fn categorize(&self, domain: &str) -> Option<&Category> {
        let domain = domain.to_lowercase();
        let domain = domain.trim_end_matches('.');

        self.categories.iter().find(|cat| {
            cat.domains
                .iter()
                .any(|known| domain == *known || domain.ends_with(&format!(".{known}")))
                || cat.keywords.iter().any(|kw| domain.contains(kw))
        })
    }

    /// Categorize a batch of domains, grouped by category id.
    ///
    /// Uncategorized domains are omitted. Duplicate inputs collapse to one
    /// entry.
    pub fn categorize_batch<'a, I>(&self, domains: I) -> HashMap<&'static str, Vec<String>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut results: HashMap<&'static str, Vec<String>> = HashMap::new();
        for domain in domains {
            if let Some(cat) = self.categorize(domain) {
                let entry = results.entry(cat.id).or_default();
                let normalized = crate::store::normalize_domain(domain);
                if !entry.contains(&normalized) {
                    entry.push(normalized);
                }
            }
        }
        results
    }

    /// Derive alerts from a window of query records.
    ///
    /// Records are scanned in the given order; only high and medium
    /// severity matches are kept, deduplicated by domain (the first
    /// occurrence's source IP and timestamp are retained), then sorted
    /// severity-first. The sort is stable, so ties keep scan order.
    pub fn alerts_from(&self, records: &[QueryRecord]) -> Vec<Alert> {
        let mut seen = std::collections::HashSet::new();
        let mut alerts: Vec<Alert> = Vec::new();

        for record in records {
            let domain = record.domain.to_lowercase();
            if seen.contains(&domain) {
                continue;
            }

            if let Some(cat) = self.categorize(&domain) {
                if matches!(cat.severity, Severity::High | Severity::Medium) {
                    seen.insert(domain.clone());
                    alerts.push(Alert {
                        domain,
                        category: cat.id,
                        label: cat.label,
                        severity: cat.severity,
                        source_ip: record.source_ip.clone(),
                        timestamp: record.timestamp.clone(),
                    });
                }
            }
        }

        alerts.sort_by_key(|a| a.severity.rank());
        alerts
    }
}

impl Default for CategorySet {
    fn default() -> Self {
        Self::builtin()
    }
}

const BUILTIN: &[Category] = &[
    Category {
        id: "adult",
        label: "Adult Content",
        severity: Severity::High,
        domains: &[
            "pornhub.com",
            "xvideos.com",
            "xnxx.com",
            "xhamster.com",
            "redtube.com",
            "youporn.com",
            "tube8.com",
            "spankbang.com",
            "brazzers.com",
            "chaturbate.com",
            "stripchat.com",
            "onlyfans.com",
            "bongacams.com",
            "livejasmin.com",
            "cam4.com",
            "myfreecams.com",
            "porntrex.com",
            "eporner.com",
            "hqporner.com",
            "daftsex.com",
            "fapello.com",
            "rule34.xxx",
            "nhentai.net",
            "hanime.tv",
            "hentaihaven.xxx",
            "literotica.com",
            "sexstories.com",
            "fuq.com",
            "bellesa.co",
            "ixxx.com",
            "thumbzilla.com",
        ],
        keywords: &[
            "porn", "xxx", "nsfw", "hentai", "onlyfans", "fap", "nude", "sexo",
        ],
    },
    Category {
        id: "dating",
        label: "Dating / Hookup",
        severity: Severity::Medium,
        domains: &[
            "tinder.com",
            "bumble.com",
            "hinge.co",
            "grindr.com",
            "okcupid.com",
            "pof.com",
            "match.com",
            "badoo.com",
            "meetme.com",
            "skout.com",
            "yubo.live",
            "omegle.com",
            "chatroulette.com",
            "monkey.app",
            "chatrandom.com",
            "ome.tv",
            "camsurf.com",
        ],
        keywords: &["hookup", "dating", "chat-random"],
    },
    Category {
        id: "vpn_proxy",
        label: "VPN / Proxy / Bypass",
        severity: Severity::Medium,
        domains: &[
            "nordvpn.com",
            "expressvpn.com",
            "surfshark.com",
            "protonvpn.com",
            "privateinternetaccess.com",
            "cyberghostvpn.com",
            "windscribe.com",
            "hotspotshield.com",
            "tunnelbear.com",
            "hide.me",
            "psiphon.ca",
            "ultrasurf.us",
            "torproject.org",
            "1dot1dot1dot1.cloudflare-dns.com",
            "dns.google",
            "dns.cloudflare.com",
            "doh.opendns.com",
        ],
        keywords: &["vpn", "unblock", "anonymo", "proxy-"],
    },
    Category {
        id: "social_media",
        label: "Social Media",
        severity: Severity::Low,
        domains: &[
            "tiktok.com",
            "instagram.com",
            "snapchat.com",
            "facebook.com",
            "twitter.com",
            "x.com",
            "reddit.com",
            "tumblr.com",
            "pinterest.com",
            "threads.net",
            "bsky.app",
            "mastodon.social",
            "discord.com",
            "discordapp.com",
            "telegram.org",
            "t.me",
            "whatsapp.com",
            "signal.org",
        ],
        keywords: &[],
    },
    Category {
        id: "gaming",
        label: "Gaming",
        severity: Severity::Low,
        domains: &[
            "roblox.com",
            "fortnite.com",
            "epicgames.com",
            "steampowered.com",
            "minecraft.net",
            "twitch.tv",
            "origin.com",
            "ea.com",
            "xbox.com",
            "playstation.com",
            "nintendo.com",
            "riot.games",
            "blizzard.com",
            "valve.com",
            "riotgames.com",
        ],
        keywords: &[],
    },
    Category {
        id: "streaming",
        label: "Streaming / Video",
        severity: Severity::Low,
        domains: &[
            "youtube.com",
            "netflix.com",
            "hulu.com",
            "disneyplus.com",
            "hbomax.com",
            "max.com",
            "peacocktv.com",
            "paramountplus.com",
            "crunchyroll.com",
            "funimation.com",
            "spotify.com",
            "soundcloud.com",
            "music.apple.com",
        ],
        keywords: &[],
    },
    Category {
        id: "gambling",
        label: "Gambling",
        severity: Severity::High,
        domains: &[
            "draftkings.com",
            "fanduel.com",
            "betmgm.com",
            "caesars.com",
            "bet365.com",
            "bovada.lv",
            "pokerstars.com",
            "888poker.com",
            "stake.com",
            "rollbit.com",
        ],
        keywords: &["casino", "gambling", "betting", "slots", "sportsbet"],
    },
    Category {
        id: "drugs",
        label: "Drugs / Substances",
        severity: Severity::High,
        domains: &["erowid.org", "leafly.com", "weedmaps.com"],
        keywords: &["weed", "cannabis", "drugs-forum", "vapestore"],
    },
    Category {
        id: "weapons",
        label: "Weapons",
        severity: Severity::High,
        domains: &[
            "gunbroker.com",
            "budsgunshop.com",
            "palmettostatearmory.com",
        ],
        keywords: &[],
    },
    Category {
        id: "self_harm",
        label: "Self-Harm / Crisis",
        severity: Severity::High,
        domains: &[
            "suicidepreventionlifeline.org",
            "988lifeline.org",
            "crisistextline.org",
        ],
        keywords: &["self-harm", "suicide"],
    },
];
