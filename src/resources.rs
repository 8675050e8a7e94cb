use std::collections::BTreeMap;
use std::sync::Arc;

use http::Method;
use rand::seq::SliceRandom;
use serde_json::Value;

use crate::host::HostAddr;
use crate::pool::{Exchange, Pool, Step};
use crate::response::Response;
use crate::transport::{Connector, TcpConnector};
use crate::Error;

/// Thread-safe mapping of hosts to connection pools.
///
/// The host set is fixed at construction from `host[:port]` strings; one
/// pool per host, every pool bound to its host.
/// [`unicast()`][Resources::unicast] picks one host at random, biased
/// towards hosts with more idle connections cached.
/// [`broadcast()`][Resources::broadcast] issues the same request to every
/// host with the requests overlapped.
#[derive(Debug)]
pub struct Resources {
    pools: Vec<Pool>,
}

impl Resources {
    /// New resources over plain TCP with a shared idle limit per host.
    pub fn new<I, S>(hosts: I, limit: usize) -> Result<Resources, Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Resources::with_connector(hosts, limit, Arc::new(TcpConnector))
    }

    /// New resources opening transports through the given connector.
    pub fn with_connector<I, S>(
        hosts: I,
        limit: usize,
        connector: Arc<dyn Connector>,
    ) -> Result<Resources, Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let pools = hosts
            .into_iter()
            .map(|host| Pool::with_connector(host.as_ref(), limit, Arc::clone(&connector)))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Resources { pools })
    }

    /// The managed hosts, in construction order.
    pub fn hosts(&self) -> impl Iterator<Item = &HostAddr> + '_ {
        self.pools.iter().map(|p| p.host())
    }

    /// The pool serving `host`, if it is managed here.
    pub fn pool(&self, host: &str) -> Option<&Pool> {
        let addr = HostAddr::parse(host).ok()?;
        self.pools.iter().find(|p| *p.host() == addr)
    }

    /// Selection priority for a host; lower is preferred.
    ///
    /// The default policy is the negative idle-connection count, so the
    /// host with the most cached connections wins. `None` eliminates a
    /// host from consideration entirely; a host not managed here is
    /// eliminated.
    pub fn priority(&self, host: &str) -> Option<i64> {
        let pool = self.pool(host)?;
        Some(-(pool.idle_count() as i64))
    }

    /// Pick a host from `candidates` according to priority, uniformly at
    /// random among those sharing the minimum value.
    ///
    /// An empty candidate set (or one fully eliminated) is an
    /// [`Error::NoHostsAvailable`].
    pub fn choose(&self, candidates: &[&str]) -> Result<String, Error> {
        let candidates: Vec<String> = if candidates.is_empty() {
            self.pools.iter().map(|p| p.host().to_string()).collect()
        } else {
            candidates.iter().map(|s| s.to_string()).collect()
        };

        let mut groups: BTreeMap<i64, Vec<String>> = BTreeMap::new();
        for host in candidates {
            if let Some(priority) = self.priority(&host) {
                groups.entry(priority).or_default().push(host);
            }
        }

        // First group holds the minimum priority value.
        let Some((_, group)) = groups.into_iter().next() else {
            return Err(Error::NoHostsAvailable);
        };

        group
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or(Error::NoHostsAvailable)
    }

    /// Send a request to one chosen host and return its completed
    /// response. An empty `hosts` means the full set.
    ///
    /// There is no cross-host failover: if the chosen pool fails (after
    /// its own single retry) the error propagates unchanged.
    pub fn unicast(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        hosts: &[&str],
    ) -> Result<Response, Error> {
        let host = self.choose(hosts)?;
        let pool = self
            .pool(&host)
            .ok_or_else(|| Error::UnknownHost(host.clone()))?;
        pool.call(method, path, body)
    }

    /// Send a request to every host and return the completed responses
    /// in host order. An empty `hosts` means the full set, in
    /// construction order.
    ///
    /// Every target's exchange is obtained first, then advanced in
    /// lock-step rounds: all requests are dispatched in round 1 before
    /// any response is awaited in rounds 2 and 3, overlapping the hosts'
    /// network latencies without threads. The first error raised in any
    /// round propagates and aborts the remaining rounds.
    pub fn broadcast(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        hosts: &[&str],
    ) -> Result<Vec<Response>, Error> {
        let pools: Vec<&Pool> = if hosts.is_empty() {
            self.pools.iter().collect()
        } else {
            hosts
                .iter()
                .map(|host| {
                    self.pool(host)
                        .ok_or_else(|| Error::UnknownHost(host.to_string()))
                })
                .collect::<Result<_, _>>()?
        };

        let mut exchanges: Vec<Exchange<'_>> = pools
            .iter()
            .map(|pool| pool.sequence(method.clone(), path, body))
            .collect();

        let mut finals: Vec<Option<Response>> = vec![None; exchanges.len()];
        for _round in 0..Exchange::STEPS {
            for (i, exchange) in exchanges.iter_mut().enumerate() {
                if let Some(Step::Final(response)) = exchange.advance()? {
                    finals[i] = Some(response);
                }
            }
        }

        let responses: Vec<Response> = finals.into_iter().flatten().collect();
        // Every exchange settles on its third step.
        assert_eq!(responses.len(), pools.len());

        Ok(responses)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::test::{http_json, Event, FakeConnector};

    use super::*;

    fn resources(connector: &Arc<FakeConnector>, hosts: &[&str], limit: usize) -> Resources {
        Resources::with_connector(hosts, limit, connector.clone() as Arc<dyn Connector>).unwrap()
    }

    /// Complete one successful call so `host` has an idle connection.
    fn warm(resources: &Resources, connector: &Arc<FakeConnector>, host: &str) {
        connector.script(host, vec![http_json(200, "{}"), http_json(200, "{}")]);
        resources
            .pool(host)
            .unwrap()
            .call(Method::GET, "/warm", None)
            .unwrap();
    }

    #[test]
    fn every_host_gets_its_own_pool() {
        let connector = FakeConnector::new();
        let resources = resources(&connector, &["a:8080", "b:8080"], 2);

        let hosts: Vec<String> = resources.hosts().map(|h| h.to_string()).collect();
        assert_eq!(hosts, vec!["a:8080", "b:8080"]);
        assert_eq!(resources.pool("a:8080").unwrap().host().host(), "a");
        assert!(resources.pool("c:8080").is_none());
    }

    #[test]
    fn priority_is_negative_idle_count() {
        let connector = FakeConnector::new();
        let resources = resources(&connector, &["a", "b"], 4);
        warm(&resources, &connector, "a");

        assert_eq!(resources.priority("a"), Some(-1));
        assert_eq!(resources.priority("b"), Some(0));
        assert_eq!(resources.priority("nope"), None);
    }

    #[test]
    fn choose_prefers_most_idle_host() {
        let connector = FakeConnector::new();
        let resources = resources(&connector, &["a", "b"], 4);
        warm(&resources, &connector, "a");

        // Strictly lower priority value: deterministic over any number
        // of trials.
        for _ in 0..50 {
            assert_eq!(resources.choose(&["a", "b"]).unwrap(), "a");
        }
    }

    #[test]
    fn choose_breaks_ties_uniformly() {
        let connector = FakeConnector::new();
        let resources = resources(&connector, &["a", "b"], 4);

        let mut seen_a = false;
        let mut seen_b = false;
        for _ in 0..200 {
            match resources.choose(&[]).unwrap().as_str() {
                "a" => seen_a = true,
                "b" => seen_b = true,
                other => panic!("unexpected host {}", other),
            }
        }
        assert!(seen_a && seen_b);
    }

    #[test]
    fn choose_drops_eliminated_hosts() {
        let connector = FakeConnector::new();
        let resources = resources(&connector, &["a"], 2);

        assert_eq!(resources.choose(&["a", "nope"]).unwrap(), "a");
        assert!(matches!(
            resources.choose(&["nope"]),
            Err(Error::NoHostsAvailable)
        ));
    }

    #[test]
    fn choose_empty_set() {
        let connector = FakeConnector::new();
        let resources = resources(&connector, &[] as &[&str], 2);
        assert!(matches!(
            resources.choose(&[]),
            Err(Error::NoHostsAvailable)
        ));
    }

    #[test]
    fn unicast_delegates_to_chosen_pool() {
        let connector = FakeConnector::new();
        let resources = resources(&connector, &["a", "b"], 4);
        warm(&resources, &connector, "a");

        // Host a is preferred and its idle connection carries the call.
        let response = resources
            .unicast(Method::GET, "/x", None, &["a", "b"])
            .unwrap();
        assert_eq!(response.decoded().unwrap(), json!({}));
        assert_eq!(connector.connect_count("a"), 1);
        assert_eq!(connector.connect_count("b"), 0);
    }

    #[test]
    fn unicast_propagates_pool_failure() {
        let connector = FakeConnector::new();
        let resources = resources(&connector, &["a"], 2);

        // Nothing scripted: the connect is refused, and there is no
        // cross-host failover to hide it.
        let result = resources.unicast(Method::GET, "/x", None, &[]);
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[test]
    fn broadcast_returns_responses_in_host_order() {
        let connector = FakeConnector::new();
        connector.script("a", vec![http_json(200, r#""from a""#)]);
        connector.script("b", vec![http_json(200, r#""from b""#)]);

        let resources = resources(&connector, &["a", "b"], 2);
        let responses = resources.broadcast(Method::GET, "/x", None, &[]).unwrap();

        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].decoded().unwrap(), json!("from a"));
        assert_eq!(responses[1].decoded().unwrap(), json!("from b"));
    }

    #[test]
    fn broadcast_sends_everything_before_receiving_anything() {
        let connector = FakeConnector::new();
        connector.script("a", vec![http_json(200, "{}")]);
        connector.script("b", vec![http_json(200, "{}")]);
        connector.script("c", vec![http_json(200, "{}")]);

        let resources = resources(&connector, &["a", "b", "c"], 2);
        resources.broadcast(Method::GET, "/x", None, &[]).unwrap();

        let events = connector.events();
        let last_send = events
            .iter()
            .rposition(|e| matches!(e, Event::Send(_)))
            .unwrap();
        let first_read = events
            .iter()
            .position(|e| matches!(e, Event::Read(_)))
            .unwrap();
        assert!(
            last_send < first_read,
            "sends and reads interleaved: {:?}",
            events
        );
    }

    #[test]
    fn broadcast_subset_preserves_given_order() {
        let connector = FakeConnector::new();
        connector.script("a", vec![http_json(200, r#""from a""#)]);
        connector.script("c", vec![http_json(200, r#""from c""#)]);

        let resources = resources(&connector, &["a", "b", "c"], 2);
        let responses = resources
            .broadcast(Method::GET, "/x", None, &["c", "a"])
            .unwrap();

        assert_eq!(responses[0].decoded().unwrap(), json!("from c"));
        assert_eq!(responses[1].decoded().unwrap(), json!("from a"));
        assert_eq!(connector.connect_count("b"), 0);
    }

    #[test]
    fn broadcast_unknown_host_fails() {
        let connector = FakeConnector::new();
        let resources = resources(&connector, &["a"], 2);

        let result = resources.broadcast(Method::GET, "/x", None, &["a", "nope"]);
        assert!(matches!(result, Err(Error::UnknownHost(_))));
    }

    #[test]
    fn broadcast_retries_within_rounds() {
        let connector = FakeConnector::new();
        // Host a needs its single retry, host b answers at once. The
        // lock-step rounds still settle both.
        connector.script("a", vec![]);
        connector.script("a", vec![http_json(200, r#""recovered""#)]);
        connector.script("b", vec![http_json(200, r#""fine""#)]);

        let resources = resources(&connector, &["a", "b"], 2);
        let responses = resources.broadcast(Method::GET, "/x", None, &[]).unwrap();

        assert_eq!(responses[0].decoded().unwrap(), json!("recovered"));
        assert_eq!(responses[1].decoded().unwrap(), json!("fine"));
    }

    #[test]
    fn broadcast_aborts_on_error() {
        let connector = FakeConnector::new();
        // Host a dies twice: the retry also fails and the whole
        // broadcast aborts.
        connector.script("a", vec![]);
        connector.script("a", vec![]);
        connector.script("b", vec![http_json(200, "{}")]);

        let resources = resources(&connector, &["a", "b"], 2);
        let result = resources.broadcast(Method::GET, "/x", None, &[]);
        assert!(matches!(result, Err(Error::UnexpectedEof)));
    }
}
