//! RFC 5626 scenarios: `ob` contact tagging, registrar flow paths, and a
//! full proxy chain with flow-failure detection.

mod support;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use sipflow_call_core::{
    CallCtx, DefaultHandler, ProxyOpts, RequestOpts, RequestReply, RouteAction, ServiceHandler,
    SipReply,
};
use sipflow_registrar_core::BindingKey;
use sipflow_sip_core::{Method, NameAddr, Request, Scheme, StatusCode, TransportKind, Uri};
use sipflow_sip_transport::MemHub;

use support::{config, node, request, route_to, routed_request};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Declines INVITEs, answers everything else.
struct Decliner;

impl ServiceHandler for Decliner {
    fn on_request(&self, request: &Request) -> RequestReply {
        match request.method {
            Method::Invite => RequestReply::Reply(SipReply::new(StatusCode::DECLINE)),
            _ => RequestReply::Reply(SipReply::new(StatusCode::OK)),
        }
    }
}

fn sent_contact(hub: &MemHub, to: SocketAddr, method: &Method) -> NameAddr {
    hub.frames_to(to)
        .into_iter()
        .filter_map(|f| f.message.as_request().cloned())
        .find(|r| r.method == *method)
        .unwrap_or_else(|| panic!("no {method} delivered to {to}"))
        .contacts
        .first()
        .cloned()
        .expect("request carries a Contact")
}

#[tokio::test]
async fn contact_gets_ob_only_for_dialog_forming_with_outbound() {
    let hub = MemHub::new();
    let ua1 = node(
        &hub,
        TransportKind::Udp,
        "127.0.2.1:9060",
        config("ua1"),
        Arc::new(DefaultHandler),
    );
    let ua2 = node(
        &hub,
        TransportKind::Udp,
        "127.0.2.2:9060",
        config("ua2"),
        Arc::new(Decliner),
    );

    let opts = RequestOpts {
        contact: true,
        ..RequestOpts::default()
    };

    // INVITE: dialog-forming + outbound supported → Contact carries `ob`.
    let invite = request(Method::Invite, "alice", "bob", Uri::new("127.0.2.2").with_port(9060));
    let rsp = timeout(TEST_TIMEOUT, ua1.stack.request(invite, opts.clone()))
        .await
        .expect("timeout")
        .expect("request");
    assert_eq!(rsp.status, StatusCode::DECLINE);
    let contact = sent_contact(&hub, ua2.addr, &Method::Invite);
    assert!(contact.uri.has_param("ob"), "INVITE contact must carry ob");
    assert!(contact.param("+sip.instance").is_some());

    // OPTIONS is not dialog-forming → no `ob`.
    let options = request(Method::Options, "alice", "bob", Uri::new("127.0.2.2").with_port(9060));
    let rsp = timeout(TEST_TIMEOUT, ua1.stack.request(options, opts.clone()))
        .await
        .expect("timeout")
        .expect("request");
    assert_eq!(rsp.status, StatusCode::OK);
    let contact = sent_contact(&hub, ua2.addr, &Method::Options);
    assert!(!contact.uri.has_param("ob"), "OPTIONS contact must not carry ob");

    // Without `outbound` in Supported even the INVITE loses `ob`.
    let ua3 = node(
        &hub,
        TransportKind::Udp,
        "127.0.2.3:9060",
        config("ua3").with_supported(&["path"]),
        Arc::new(DefaultHandler),
    );
    let invite = request(Method::Invite, "carol", "bob", Uri::new("127.0.2.2").with_port(9060));
    let rsp = timeout(TEST_TIMEOUT, ua3.stack.request(invite, opts))
        .await
        .expect("timeout")
        .expect("request");
    assert_eq!(rsp.status, StatusCode::DECLINE);
    let frames = hub.frames_to(ua2.addr);
    let last_invite = frames
        .iter()
        .rev()
        .filter_map(|f| f.message.as_request())
        .find(|r| r.method == Method::Invite)
        .unwrap();
    assert!(!last_invite.contacts[0].uri.has_param("ob"));
}

/// Registrar service: REGISTER binds, anything else proxies to the stored
/// contacts.
struct RegistrarService;

impl ServiceHandler for RegistrarService {
    fn route(
        &self,
        _scheme: Scheme,
        _user: &str,
        _host: &str,
        request: &Request,
        call: &CallCtx<'_>,
    ) -> RouteAction {
        if request.method == Method::Register {
            return RouteAction::Process;
        }
        let Some(registrar) = call.registrar else {
            return RouteAction::Reply(SipReply::new(StatusCode::INTERNAL_ERROR));
        };
        match registrar.find(&request.uri) {
            Ok(contacts) => RouteAction::Proxy {
                targets: vec![contacts.into_iter().map(|c| c.uri).collect()],
                opts: ProxyOpts::default(),
            },
            Err(_) => RouteAction::Reply(SipReply::new(StatusCode::NOT_FOUND)),
        }
    }
}

#[tokio::test]
async fn register_over_tcp_stores_flow_path_and_dies_with_the_connection() {
    let hub = MemHub::new();
    let registrar = node(
        &hub,
        TransportKind::Tcp,
        "127.0.3.1:5100",
        config("registrar").with_plugin(sipflow_call_core::Plugin::Registrar),
        Arc::new(RegistrarService),
    );
    let ua1 = node(
        &hub,
        TransportKind::Tcp,
        "127.0.3.2:5101",
        config("ua1"),
        Arc::new(DefaultHandler),
    );
    let ua2 = node(
        &hub,
        TransportKind::Tcp,
        "127.0.3.3:5102",
        config("ua2"),
        Arc::new(DefaultHandler),
    );

    // UA1 registers over TCP.
    let mut reg = routed_request(Method::Register, "ua1", "alice", registrar.addr, TransportKind::Tcp);
    reg.expires = Some(300);
    let opts = RequestOpts {
        contact: true,
        ..RequestOpts::default()
    };
    let rsp = timeout(TEST_TIMEOUT, ua1.stack.request(reg, opts))
        .await
        .expect("timeout")
        .expect("request");
    assert_eq!(rsp.status, StatusCode::OK);
    // No reg-id was used, so nothing is Require'd of the client.
    assert!(rsp.require.is_empty());
    // But the registrar still minted a flow Path for the TCP connection.
    assert!(rsp.paths[0].uri.user.as_deref().unwrap().starts_with("NkF"));

    let aor: Uri = "sip:alice@example.com".parse().unwrap();
    let bindings = registrar
        .stack
        .registrar()
        .unwrap()
        .find_bindings(&aor)
        .unwrap();
    assert!(matches!(
        bindings[0].key,
        BindingKey::Contact {
            transport: TransportKind::Tcp,
            port: 5101,
            ..
        }
    ));

    // The REGISTER's 200 travelled registrar→UA1 over the same link the
    // follow-up OPTIONS must reuse.
    let register_rsp_flow = hub
        .frames_to(ua1.addr)
        .into_iter()
        .find(|f| f.message.as_response().is_some())
        .expect("200 to REGISTER")
        .flow;

    // UA2 reaches UA1 through the registrar; the proxied OPTIONS rides the
    // registrar-UA1 connection recorded in the Path.
    let options = routed_request(Method::Options, "ua2", "alice", registrar.addr, TransportKind::Tcp);
    let rsp = timeout(TEST_TIMEOUT, ua2.stack.request(options, RequestOpts::default()))
        .await
        .expect("timeout")
        .expect("request");
    assert_eq!(rsp.status, StatusCode::OK);

    let options_flow = hub
        .frames_to(ua1.addr)
        .into_iter()
        .find(|f| {
            f.message
                .as_request()
                .is_some_and(|r| r.method == Method::Options)
        })
        .expect("OPTIONS forwarded to UA1")
        .flow;
    assert_eq!(options_flow, register_rsp_flow, "flow not reused");

    // Kill the connection: the stored flow token now fails.
    hub.close_link(registrar.addr, ua1.addr);
    let options = routed_request(Method::Options, "ua2", "alice", registrar.addr, TransportKind::Tcp);
    let rsp = timeout(TEST_TIMEOUT, ua2.stack.request(options, RequestOpts::default()))
        .await
        .expect("timeout")
        .expect("request");
    assert_eq!(rsp.status, StatusCode::FLOW_FAILED);
}

/// A chain proxy: REGISTERs go to `next` (adding Path when `path`), other
/// requests follow their routes.
struct ChainProxy {
    next: SocketAddr,
    path: bool,
}

impl ServiceHandler for ChainProxy {
    fn route(
        &self,
        _scheme: Scheme,
        _user: &str,
        _host: &str,
        request: &Request,
        _call: &CallCtx<'_>,
    ) -> RouteAction {
        if request.method == Method::Register {
            RouteAction::Proxy {
                targets: Vec::new(),
                opts: ProxyOpts {
                    path: self.path,
                    ..ProxyOpts::default()
                }
                .with_route(route_to(self.next, TransportKind::Tcp)),
            }
        } else {
            RouteAction::Proxy {
                targets: Vec::new(),
                opts: ProxyOpts::default(),
            }
        }
    }
}

#[tokio::test]
async fn proxy_chain_with_outbound_paths_and_flow_failure() {
    let hub = MemHub::new();
    let registrar = node(
        &hub,
        TransportKind::Tcp,
        "127.0.4.1:5100",
        config("registrar").with_plugin(sipflow_call_core::Plugin::Registrar),
        Arc::new(RegistrarService),
    );
    let p3 = node(
        &hub,
        TransportKind::Tcp,
        "127.0.4.3:5100",
        config("p3"),
        Arc::new(ChainProxy {
            next: registrar.addr,
            path: true,
        }),
    );
    let p2 = node(
        &hub,
        TransportKind::Tcp,
        "127.0.4.2:5100",
        config("p2"),
        Arc::new(ChainProxy {
            next: p3.addr,
            path: false,
        }),
    );
    let p1 = node(
        &hub,
        TransportKind::Tcp,
        "127.0.4.4:5100",
        config("p1"),
        Arc::new(ChainProxy {
            next: p2.addr,
            path: true,
        }),
    );
    let ua1 = node(
        &hub,
        TransportKind::Tcp,
        "127.0.4.5:5101",
        config("ua1"),
        Arc::new(DefaultHandler),
    );
    let ua2 = node(
        &hub,
        TransportKind::Tcp,
        "127.0.4.6:5102",
        config("ua2"),
        Arc::new(DefaultHandler),
    );

    // UA1 registers through P1 → P2 → P3 → registrar, asking for outbound.
    let mut reg = routed_request(Method::Register, "ua1", "alice", p1.addr, TransportKind::Tcp);
    reg.expires = Some(300);
    let opts = RequestOpts {
        contact: true,
        reg_id: Some(1),
        ..RequestOpts::default()
    };
    let rsp = timeout(TEST_TIMEOUT, ua1.stack.request(reg, opts.clone()))
        .await
        .expect("timeout")
        .expect("request");
    assert_eq!(rsp.status, StatusCode::OK);
    assert_eq!(rsp.require, vec!["outbound".to_string()]);

    // The registrar stored the reversed Path list: P3 (no ob) nearest to
    // itself, P1 (ob + flow token pinning the UA1 connection) as first hop.
    let aor: Uri = "sip:alice@example.com".parse().unwrap();
    let bindings = registrar
        .stack
        .registrar()
        .unwrap()
        .find_bindings(&aor)
        .unwrap();
    assert!(matches!(bindings[0].key, BindingKey::Outbound { reg_id: 1, .. }));
    let path = &bindings[0].path;
    assert_eq!(path.len(), 2);
    assert!(path[0].uri.user.as_deref().unwrap().starts_with("NkF"));
    assert!(!path[0].uri.has_param("ob"), "P3 path must not carry ob");
    assert!(path[1].uri.user.as_deref().unwrap().starts_with("NkF"));
    assert!(path[1].uri.has_param("ob"), "first-hop path must carry ob");

    // OPTIONS back to the binding retraces P3 → P2 → P1 → UA1.
    let options = routed_request(Method::Options, "ua2", "alice", registrar.addr, TransportKind::Tcp);
    let rsp = timeout(TEST_TIMEOUT, ua2.stack.request(options, RequestOpts::default()))
        .await
        .expect("timeout")
        .expect("request");
    assert_eq!(rsp.status, StatusCode::OK);
    let hops: Vec<SocketAddr> = hub
        .frames()
        .into_iter()
        .filter(|f| {
            f.message
                .as_request()
                .is_some_and(|r| r.method == Method::Options)
        })
        .map(|f| f.to)
        .collect();
    assert_eq!(
        hops,
        vec![registrar.addr, p3.addr, p2.addr, p1.addr, ua1.addr]
    );

    // Killing the P1 → UA1 flow makes the next OPTIONS fail with 430.
    hub.close_link(p1.addr, ua1.addr);
    let options = routed_request(Method::Options, "ua2", "alice", registrar.addr, TransportKind::Tcp);
    let rsp = timeout(TEST_TIMEOUT, ua2.stack.request(options, RequestOpts::default()))
        .await
        .expect("timeout")
        .expect("request");
    assert_eq!(rsp.status, StatusCode::FLOW_FAILED);

    // A REGISTER that enters at P2 has a pathless first hop: 439.
    let mut reg = routed_request(Method::Register, "ua1", "alice", p2.addr, TransportKind::Tcp);
    reg.expires = Some(300);
    let rsp = timeout(TEST_TIMEOUT, ua1.stack.request(reg, opts))
        .await
        .expect("timeout")
        .expect("request");
    assert_eq!(rsp.status, StatusCode::FIRST_HOP_LACKS_OUTBOUND);
}
