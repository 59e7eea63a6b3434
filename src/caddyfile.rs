//! Caddyfile synthesis from registry text
//!
//! The output is a pure function of the registry contents: a fixed global
//! options block followed by one site block per complete record, in registry
//! order.

use crate::registry::{parse_records, RegistryRecord};

/// Default access log location inside the proxy container
pub const DEFAULT_ACCESS_LOG: &str = "/var/log/caddy/access.log";

/// Renders proxy configuration for the registered sites
#[derive(Debug, Clone)]
pub struct ProxyConfigSynthesizer {
    access_log: String,
}

impl Default for ProxyConfigSynthesizer {
    fn default() -> Self {
        Self::new(DEFAULT_ACCESS_LOG)
    }
}

impl ProxyConfigSynthesizer {
    pub fn new(access_log: &str) -> Self {
        Self {
            access_log: access_log.to_string(),
        }
    }

    /// Global options block. TLS is left to whatever sits in front of the proxy.
    pub fn header(&self) -> String {
        format!(
            "# Auto-generated Caddyfile - do not edit manually\n\
             {{\n    \
                 admin off\n    \
                 auto_https off\n    \
                 log {{\n        \
                     output file {}\n        \
                     format json\n    \
                 }}\n\
             }}\n",
            self.access_log
        )
    }

    /// Full configuration for the given registry text
    pub fn synthesize(&self, registry_text: &str) -> String {
        self.render(&parse_records(registry_text))
    }

    /// Full configuration for already parsed records. Incomplete records are skipped.
    pub fn render(&self, records: &[RegistryRecord]) -> String {
        let mut out = self.header();
        for record in records.iter().filter(|r| r.is_complete()) {
            out.push_str(&site_block(record));
        }
        out
    }
}

fn site_block(record: &RegistryRecord) -> String {
    format!(
        "\n{host}, www.{host} {{\n    reverse_proxy {container}:{port}\n}}\n",
        host = record.hostname,
        container = record.container,
        port = record.port
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header() {
        let header = ProxyConfigSynthesizer::default().header();
        assert_eq!(
            header,
            "# Auto-generated Caddyfile - do not edit manually\n{\n    admin off\n    auto_https off\n    log {\n        output file /var/log/caddy/access.log\n        format json\n    }\n}\n"
        );
    }

    #[test]
    fn test_single_site_block() {
        let synth = ProxyConfigSynthesizer::default();
        let text = "sites:\n\n  a.example.com:\n    container: webapp\n    port: 3000\n    type: node\n";

        let config = synth.synthesize(text);

        assert_eq!(
            config,
            format!(
                "{}\na.example.com, www.a.example.com {{\n    reverse_proxy webapp:3000\n}}\n",
                synth.header()
            )
        );
    }

    #[test]
    fn test_blocks_follow_registry_order() {
        let synth = ProxyConfigSynthesizer::default();
        let records = vec![
            RegistryRecord::new("zeta.example.com", "zeta", 80, "static"),
            RegistryRecord::new("alpha.example.com", "alpha", 8000, "python"),
        ];

        let config = synth.render(&records);

        let zeta = config.find("zeta.example.com, www.zeta.example.com").unwrap();
        let alpha = config.find("alpha.example.com, www.alpha.example.com").unwrap();
        assert!(zeta < alpha);
        assert!(config.contains("reverse_proxy alpha:8000"));
    }

    #[test]
    fn test_incomplete_records_are_dropped() {
        let synth = ProxyConfigSynthesizer::default();
        let text = "sites:\n  noport.example.com:\n    container: noport\n  nocontainer.example.com:\n    port: 80\n  ok.example.com:\n    container: ok\n    port: 80\n";

        let config = synth.synthesize(text);

        assert!(!config.contains("noport"));
        assert!(!config.contains("nocontainer"));
        assert!(config.contains("reverse_proxy ok:80"));
    }

    #[test]
    fn test_empty_registry_renders_header_only() {
        let synth = ProxyConfigSynthesizer::new("/tmp/access.log");
        let config = synth.synthesize("sites:\n");
        assert_eq!(config, synth.header());
        assert!(config.contains("output file /tmp/access.log"));
    }

    #[test]
    fn test_synthesis_is_deterministic() {
        let synth = ProxyConfigSynthesizer::default();
        let text = "sites:\n  a.example.com:\n    container: a\n    port: 80\n  b.example.com:\n    container: b\n    port: 3000\n";
        assert_eq!(synth.synthesize(text), synth.synthesize(text));
    }
}
