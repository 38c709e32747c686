//! Event classes and record synthesis.
//!
//! One event is a small burst of related flows: a browsing session, a DNS
//! exchange, a mail delivery. Each class declares the share of total records
//! it should contribute and how many records one of its events produces;
//! the dispatcher turns those into range weights.

use std::net::Ipv4Addr;
use std::sync::Arc;

use rand::Rng;
use rand::rngs::StdRng;

use crate::flowrec::{FlowRecord, FlowtypeId, SensorId};
use crate::site::Site;

/// Record count of one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecsPerEvent {
    /// Every event produces exactly this many records.
    Exact(u32),
    /// Events produce between one and this many records.
    UpTo(u32),
}

impl RecsPerEvent {
    /// Expected records per event, used for dispatch weighting.
    pub fn mean(self) -> f64 {
        match self {
            RecsPerEvent::Exact(n) => f64::from(n),
            RecsPerEvent::UpTo(n) => f64::from(n + 1) / 2.0,
        }
    }
}

/// Traffic shape an event class synthesizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassKind {
    Web,
    Dns,
    Mail,
    Bulk,
    Icmp,
}

/// One generator class: a traffic shape plus its share of the output.
#[derive(Debug, Clone)]
pub struct EventClass {
    pub name: &'static str,
    pub kind: ClassKind,
    /// Share of all generated records, in percent.
    pub target_percent: f64,
    pub recs_per_event: RecsPerEvent,
}

impl EventClass {
    /// Dispatch weight: record share normalized by records per event.
    pub fn weight(&self) -> f64 {
        self.target_percent / self.recs_per_event.mean()
    }
}

/// The default class mix.
pub fn standard_classes() -> Vec<EventClass> {
    vec![
        EventClass {
            name: "web",
            kind: ClassKind::Web,
            target_percent: 45.0,
            recs_per_event: RecsPerEvent::UpTo(8),
        },
        EventClass {
            name: "dns",
            kind: ClassKind::Dns,
            target_percent: 25.0,
            recs_per_event: RecsPerEvent::Exact(2),
        },
        EventClass {
            name: "mail",
            kind: ClassKind::Mail,
            target_percent: 10.0,
            recs_per_event: RecsPerEvent::Exact(4),
        },
        EventClass {
            name: "bulk",
            kind: ClassKind::Bulk,
            target_percent: 15.0,
            recs_per_event: RecsPerEvent::UpTo(4),
        },
        EventClass {
            name: "icmp",
            kind: ClassKind::Icmp,
            target_percent: 5.0,
            recs_per_event: RecsPerEvent::Exact(2),
        },
    ]
}

/// Maps an internal address to the sensor that observes it.
pub type SensorForIp = Box<dyn Fn(Ipv4Addr) -> Option<SensorId> + Send + Sync>;

/// Shared generation context: site handle, sensor set, and flowtype roles.
pub struct GenContext {
    pub site: Arc<dyn Site + Send + Sync>,
    pub sensors: Vec<SensorId>,
    pub ft_in: FlowtypeId,
    pub ft_inweb: FlowtypeId,
    pub ft_out: FlowtypeId,
    pub ft_outweb: FlowtypeId,
    /// Prefix-map lookup; falls back to a random sensor when absent or when
    /// the lookup declines an address.
    pub sensor_for_ip: Option<SensorForIp>,
}

impl GenContext {
    fn sensor_for(&self, internal: Ipv4Addr, rng: &mut StdRng) -> SensorId {
        if let Some(lookup) = &self.sensor_for_ip {
            if let Some(sensor) = lookup(internal) {
                return sensor;
            }
        }
        self.sensors[rng.random_range(0..self.sensors.len())]
    }
}

const TCP: u8 = 6;
const UDP: u8 = 17;
const ICMP: u8 = 1;

const FIN: u8 = 0x01;
const SYN: u8 = 0x02;
const PSH: u8 = 0x08;
const ACK: u8 = 0x10;

fn internal_host(rng: &mut StdRng) -> Ipv4Addr {
    Ipv4Addr::new(10, rng.random_range(0..4), rng.random(), rng.random())
}

fn external_host(rng: &mut StdRng) -> Ipv4Addr {
    Ipv4Addr::new(
        rng.random_range(11..224),
        rng.random(),
        rng.random(),
        rng.random(),
    )
}

struct Exchange {
    client: Ipv4Addr,
    server: Ipv4Addr,
    client_port: u16,
    server_port: u16,
    sensor: SensorId,
}

impl Exchange {
    fn new(rng: &mut StdRng, ctx: &GenContext, server_port: u16) -> Self {
        let client = internal_host(rng);
        Self {
            client,
            server: external_host(rng),
            client_port: rng.random_range(1024..=65535),
            server_port,
            sensor: ctx.sensor_for(client, rng),
        }
    }

    /// Flow from the internal client out to the server.
    fn outbound(
        &self,
        ft: FlowtypeId,
        proto: u8,
        start: i64,
        dur: u32,
        packets: u32,
        bytes: u32,
        flags: u8,
    ) -> FlowRecord {
        FlowRecord {
            sip: self.client,
            dip: self.server,
            sport: self.client_port,
            dport: self.server_port,
            proto,
            flags,
            init_flags: if proto == TCP { SYN } else { 0 },
            sess_flags: if proto == TCP { flags & !SYN } else { 0 },
            attributes: 0,
            packets,
            bytes,
            start_time_ms: start,
            duration_ms: dur,
            sensor: self.sensor,
            flowtype: ft,
            input: 1,
            output: 2,
            application: self.server_port,
        }
    }

    /// The server's answer back to the internal client.
    fn inbound(
        &self,
        ft: FlowtypeId,
        proto: u8,
        start: i64,
        dur: u32,
        packets: u32,
        bytes: u32,
        flags: u8,
    ) -> FlowRecord {
        FlowRecord {
            sip: self.server,
            dip: self.client,
            sport: self.server_port,
            dport: self.client_port,
            proto,
            flags,
            init_flags: if proto == TCP { SYN | ACK } else { 0 },
            sess_flags: if proto == TCP { flags & !SYN } else { 0 },
            attributes: 0,
            packets,
            bytes,
            start_time_ms: start,
            duration_ms: dur,
            sensor: self.sensor,
            flowtype: ft,
            input: 2,
            output: 1,
            application: self.server_port,
        }
    }
}

/// Synthesize the records of one event of `class` at time `now_ms`.
pub fn generate_event(
    class: &EventClass,
    rng: &mut StdRng,
    ctx: &GenContext,
    now_ms: i64,
) -> Vec<FlowRecord> {
    let count = match class.recs_per_event {
        RecsPerEvent::Exact(n) => n,
        RecsPerEvent::UpTo(n) => rng.random_range(1..=n),
    };
    match class.kind {
        ClassKind::Web => web_event(rng, ctx, now_ms, count),
        ClassKind::Dns => dns_event(rng, ctx, now_ms),
        ClassKind::Mail => mail_event(rng, ctx, now_ms),
        ClassKind::Bulk => bulk_event(rng, ctx, now_ms, count),
        ClassKind::Icmp => icmp_event(rng, ctx, now_ms),
    }
}

fn web_event(rng: &mut StdRng, ctx: &GenContext, now: i64, count: u32) -> Vec<FlowRecord> {
    let port = if rng.random_bool(0.8) { 443 } else { 80 };
    let mut recs = Vec::with_capacity(count as usize);
    let mut ex = Exchange::new(rng, ctx, port);
    for i in 0..count {
        // A session re-uses the client but fans out across servers.
        if i > 0 && rng.random_bool(0.5) {
            ex.server = external_host(rng);
            ex.client_port = rng.random_range(1024..=65535);
        }
        let start = now + i64::from(i) * rng.random_range(50i64..500);
        let dur = rng.random_range(100..30_000);
        let req_bytes = rng.random_range(300..2_000);
        let resp_bytes = rng.random_range(1_000..500_000);
        if i % 2 == 0 {
            recs.push(ex.outbound(
                ctx.ft_outweb,
                TCP,
                start,
                dur,
                rng.random_range(4..40),
                req_bytes,
                SYN | ACK | PSH | FIN,
            ));
        } else {
            recs.push(ex.inbound(
                ctx.ft_inweb,
                TCP,
                start,
                dur,
                rng.random_range(4..400),
                resp_bytes,
                SYN | ACK | PSH | FIN,
            ));
        }
    }
    recs
}

fn dns_event(rng: &mut StdRng, ctx: &GenContext, now: i64) -> Vec<FlowRecord> {
    let ex = Exchange::new(rng, ctx, 53);
    let dur = rng.random_range(1..200);
    vec![
        ex.outbound(ctx.ft_out, UDP, now, dur, 1, rng.random_range(40..120), 0),
        ex.inbound(
            ctx.ft_in,
            UDP,
            now + i64::from(dur),
            dur,
            1,
            rng.random_range(80..512),
            0,
        ),
    ]
}

fn mail_event(rng: &mut StdRng, ctx: &GenContext, now: i64) -> Vec<FlowRecord> {
    let ex = Exchange::new(rng, ctx, 25);
    let dur = rng.random_range(500..10_000);
    let msg_bytes = rng.random_range(2_000..200_000);
    vec![
        ex.outbound(ctx.ft_out, TCP, now, dur, 8, 600, SYN | ACK | PSH | FIN),
        ex.inbound(ctx.ft_in, TCP, now + 20, dur, 6, 400, SYN | ACK | PSH | FIN),
        ex.outbound(
            ctx.ft_out,
            TCP,
            now + 50,
            dur,
            rng.random_range(10..200),
            msg_bytes,
            ACK | PSH,
        ),
        ex.inbound(ctx.ft_in, TCP, now + 80, dur, 4, 300, ACK | FIN),
    ]
}

fn bulk_event(rng: &mut StdRng, ctx: &GenContext, now: i64, count: u32) -> Vec<FlowRecord> {
    let ex = Exchange::new(rng, ctx, 873);
    let mut recs = Vec::with_capacity(count as usize);
    for i in 0..count {
        let start = now + i64::from(i) * 1000;
        let dur = rng.random_range(10_000..300_000);
        if i % 2 == 0 {
            recs.push(ex.outbound(
                ctx.ft_out,
                TCP,
                start,
                dur,
                rng.random_range(1_000..100_000),
                rng.random_range(1_000_000..100_000_000),
                SYN | ACK | PSH,
            ));
        } else {
            recs.push(ex.inbound(
                ctx.ft_in,
                TCP,
                start,
                dur,
                rng.random_range(500..50_000),
                rng.random_range(20_000..2_000_000),
                SYN | ACK,
            ));
        }
    }
    recs
}

fn icmp_event(rng: &mut StdRng, ctx: &GenContext, now: i64) -> Vec<FlowRecord> {
    let mut ex = Exchange::new(rng, ctx, 0);
    ex.client_port = 0;
    let dur = rng.random_range(1..100);
    // ICMP type/code ride in the destination port: echo request 8.0, reply 0.0.
    let mut request = ex.outbound(ctx.ft_out, ICMP, now, dur, 1, 64, 0);
    request.dport = 8 << 8;
    let mut reply = ex.inbound(ctx.ft_in, ICMP, now + i64::from(dur), dur, 1, 64, 0);
    reply.dport = 0;
    vec![request, reply]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::site::SiteConfig;
    use rand::SeedableRng;

    fn test_ctx() -> GenContext {
        GenContext {
            site: Arc::new(SiteConfig::default_site()),
            sensors: vec![0, 1, 2],
            ft_in: 0,
            ft_inweb: 1,
            ft_out: 2,
            ft_outweb: 3,
            sensor_for_ip: None,
        }
    }

    #[test]
    fn test_weight_normalizes_by_event_size() {
        let classes = standard_classes();
        let dns = classes.iter().find(|c| c.name == "dns").unwrap();
        assert!((dns.weight() - 12.5).abs() < 1e-9);
        let web = classes.iter().find(|c| c.name == "web").unwrap();
        assert!((web.weight() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_exact_classes_produce_exact_counts() {
        let ctx = test_ctx();
        let mut rng = StdRng::seed_from_u64(42);
        let classes = standard_classes();
        for class in &classes {
            let recs = generate_event(class, &mut rng, &ctx, 1000);
            match class.recs_per_event {
                RecsPerEvent::Exact(n) => assert_eq!(recs.len(), n as usize, "{}", class.name),
                RecsPerEvent::UpTo(n) => {
                    assert!((1..=n as usize).contains(&recs.len()), "{}", class.name)
                }
            }
        }
    }

    #[test]
    fn test_records_carry_known_sensors_and_flowtypes() {
        let ctx = test_ctx();
        let mut rng = StdRng::seed_from_u64(7);
        for class in &standard_classes() {
            for rec in generate_event(class, &mut rng, &ctx, 0) {
                assert!(ctx.sensors.contains(&rec.sensor));
                assert!([ctx.ft_in, ctx.ft_inweb, ctx.ft_out, ctx.ft_outweb]
                    .contains(&rec.flowtype));
                assert!(rec.start_time_ms >= 0);
            }
        }
    }

    #[test]
    fn test_prefix_map_lookup_wins() {
        let mut ctx = test_ctx();
        ctx.sensor_for_ip = Some(Box::new(|_| Some(2)));
        let mut rng = StdRng::seed_from_u64(3);
        let dns = &standard_classes()[1];
        for rec in generate_event(dns, &mut rng, &ctx, 0) {
            assert_eq!(rec.sensor, 2);
        }
    }

    #[test]
    fn test_event_content_deterministic_per_seed() {
        let ctx = test_ctx();
        let classes = standard_classes();
        let mut a = StdRng::seed_from_u64(11);
        let mut b = StdRng::seed_from_u64(11);
        for class in &classes {
            assert_eq!(
                generate_event(class, &mut a, &ctx, 500),
                generate_event(class, &mut b, &ctx, 500)
            );
        }
    }
}
