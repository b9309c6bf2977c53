//! Custom DNS resolver enforcing `ai_family` (spec.md §3). Resolves via the
//! system resolver through `tokio::net::lookup_host`, then filters by
//! address family; an empty filtered result falls back to the unfiltered
//! set rather than failing the connection outright, since `ai_family` is a
//! resolution *preference*, not a hard requirement.

use std::net::SocketAddr;

use reqwest::dns::{Addrs, Name, Resolve, Resolving};

use crate::config::AddressFamily;

pub struct FamilyResolver(pub AddressFamily);

impl Resolve for FamilyResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let family = self.0;
        Box::pin(async move {
            let host = name.as_str().to_string();
            let all: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), 0))
                .await?
                .collect();

            let filtered: Vec<SocketAddr> = all
                .iter()
                .copied()
                .filter(|addr| match family {
                    AddressFamily::Any => true,
                    AddressFamily::V4 => addr.is_ipv4(),
                    AddressFamily::V6 => addr.is_ipv6(),
                })
                .collect();

            let chosen = if filtered.is_empty() { all } else { filtered };
            Ok(Box::new(chosen.into_iter()) as Addrs)
        })
    }
}
