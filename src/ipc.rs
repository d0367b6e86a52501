//! Bridge stages that carry buffers across a processor boundary.
//!
//! Only fixed-size proxy records cross: [`IpcOutLink`] writes one record per
//! buffer into the forward [`IpcQueue`] of an [`IpcChannel`] and keeps the
//! buffer until its token comes back on the return queue. [`IpcInLink`]
//! turns each record into a local proxy descriptor, and when the proxy is
//! recycled writes the token back. Each side rings the other through a
//! [`Doorbell`].
//!
//! # Proxy record layout (little-endian)
//!
//! | offset | size | field                                 |
//! |--------|------|---------------------------------------|
//! | 0      | 4    | token                                 |
//! | 4      | 1    | buffer type                           |
//! | 5      | 1    | record flags (bit 0: payload inline)  |
//! | 6      | 2    | reserved                              |
//! | 8      | 4    | channel                               |
//! | 12     | 4    | payload size                          |
//! | 16     | 4    | descriptor flags                      |
//! | 20     | 4    | reserved                              |
//! | 24     | 8    | source timestamp                      |
//! | 32     | 8    | local timestamp                       |
//! | 40     | 8    | payload address                       |
//! | 48     | ..   | inline payload                        |

use crate::buffer::{BufferDescriptor, BufferList, BufferPool, BufferRef, BufferType};
use crate::config::IpcConfig;
use crate::error::{LinkError, Result};
use crate::ipc_queue::{IpcQueue, SharedRegion};
use crate::links::{release_logged, InputQueue, OutputQueues};
use crate::memory::PoolId;
use crate::registry::{LinkInfo, LinkOps, StageId, StageRegistry};
use crate::stage::{Link, StageContext};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Bytes of a proxy record before any inline payload
pub const PROXY_HEADER_SIZE: usize = 48;

const TOKEN_SIZE: usize = 4;
const FLAG_INLINE: u8 = 0x1;

/// One buffer as it crosses the boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRecord {
    /// Sender-side handle returned on the return queue
    pub token: u32,
    /// Metadata of the original buffer
    pub desc: BufferDescriptor,
    /// Payload copied into the record when it fits
    pub inline: Option<Vec<u8>>,
}

impl ProxyRecord {
    /// Serialize into `element`, which must hold the header and any inline
    /// payload
    pub fn encode(&self, element: &mut [u8]) -> Result<usize> {
        let inline_len = self.inline.as_ref().map_or(0, Vec::len);
        let total = PROXY_HEADER_SIZE + inline_len;
        if element.len() < total {
            return Err(LinkError::invalid(format!(
                "proxy record needs {total} bytes, element has {}",
                element.len()
            )));
        }
        let d = &self.desc;
        element[0..4].copy_from_slice(&self.token.to_le_bytes());
        element[4] = d.buf_type.as_u8();
        element[5] = if self.inline.is_some() { FLAG_INLINE } else { 0 };
        element[6..8].fill(0);
        element[8..12].copy_from_slice(&d.ch_num.to_le_bytes());
        element[12..16].copy_from_slice(&d.payload_size.to_le_bytes());
        element[16..20].copy_from_slice(&d.flags.to_le_bytes());
        element[20..24].fill(0);
        element[24..32].copy_from_slice(&d.src_timestamp.to_le_bytes());
        element[32..40].copy_from_slice(&d.local_timestamp.to_le_bytes());
        element[40..48].copy_from_slice(&d.payload_addr.to_le_bytes());
        if let Some(bytes) = &self.inline {
            element[PROXY_HEADER_SIZE..total].copy_from_slice(bytes);
        }
        Ok(total)
    }

    /// Token of a record without decoding the rest
    pub fn peek_token(element: &[u8]) -> Result<u32> {
        element
            .get(0..TOKEN_SIZE)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .ok_or_else(|| LinkError::invalid("element too short for a token"))
    }

    /// Parse a record from a whole queue element
    pub fn decode(element: &[u8]) -> Result<Self> {
        if element.len() < PROXY_HEADER_SIZE {
            return Err(LinkError::invalid(format!(
                "{}-byte element is shorter than a proxy header",
                element.len()
            )));
        }
        let u32_at = |o: usize| {
            u32::from_le_bytes([element[o], element[o + 1], element[o + 2], element[o + 3]])
        };
        let u64_at = |o: usize| (u64::from(u32_at(o + 4)) << 32) | u64::from(u32_at(o));

        let buf_type = BufferType::from_u8(element[4])
            .ok_or_else(|| LinkError::invalid(format!("unknown buffer type tag {}", element[4])))?;
        let desc = BufferDescriptor {
            buf_type,
            ch_num: u32_at(8),
            payload_size: u32_at(12),
            flags: u32_at(16),
            src_timestamp: u64_at(24),
            local_timestamp: u64_at(32),
            payload_addr: u64_at(40),
        };
        let inline = if element[5] & FLAG_INLINE != 0 {
            let end = PROXY_HEADER_SIZE + desc.payload_size as usize;
            let bytes = element.get(PROXY_HEADER_SIZE..end).ok_or_else(|| {
                LinkError::invalid(format!(
                    "inline payload of {} bytes overruns the element",
                    desc.payload_size
                ))
            })?;
            Some(bytes.to_vec())
        } else {
            None
        };
        Ok(Self {
            token: u32_at(0),
            desc,
            inline,
        })
    }
}

/// The pair of shared regions behind one IPC link pair
///
/// The forward queue carries records out, the return queue carries tokens
/// back. The sending side initializes both queues at its CREATE; the
/// receiving side attaches afterwards.
#[derive(Debug, Clone)]
pub struct IpcChannel {
    forward: Arc<SharedRegion>,
    back: Arc<SharedRegion>,
    config: IpcConfig,
}

impl IpcChannel {
    /// Allocate both regions for `config`'s geometry
    pub fn new(config: &IpcConfig) -> Result<Self> {
        if (config.element_size as usize) < PROXY_HEADER_SIZE {
            return Err(LinkError::Config(format!(
                "ipc element size {} cannot hold a {PROXY_HEADER_SIZE}-byte proxy record",
                config.element_size
            )));
        }
        Ok(Self {
            forward: SharedRegion::for_queue(config.max_elements, config.element_size)?,
            back: SharedRegion::for_queue(config.max_elements, config.element_size)?,
            config: *config,
        })
    }

    /// Region of the forward queue
    pub fn forward_region(&self) -> &Arc<SharedRegion> {
        &self.forward
    }

    /// Region of the return queue
    pub fn return_region(&self) -> &Arc<SharedRegion> {
        &self.back
    }

    /// Geometry both queues use
    pub fn config(&self) -> &IpcConfig {
        &self.config
    }

    /// Payload bytes that travel inside a record
    pub fn inline_capacity(&self) -> usize {
        self.config.element_size as usize - PROXY_HEADER_SIZE
    }
}

/// Wakes the stage on the other side of a channel
///
/// Stands in for the inter-processor interrupt.
#[derive(Clone)]
pub struct Doorbell {
    registry: Arc<StageRegistry>,
    target: StageId,
    rings: Arc<AtomicU64>,
}

impl Doorbell {
    /// Doorbell ringing `target`
    pub fn new(registry: Arc<StageRegistry>, target: StageId) -> Self {
        Self {
            registry,
            target,
            rings: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Post NEW_DATA to the target; a full mailbox already has one pending
    pub fn ring(&self) -> Result<()> {
        self.rings.fetch_add(1, Ordering::Relaxed);
        match self.registry.notify(self.target) {
            Ok(()) | Err(LinkError::Again) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Times rung
    pub fn rings(&self) -> u64 {
        self.rings.load(Ordering::Relaxed)
    }
}

/// Sending half of an IPC link pair
///
/// Buffers stay owned by this stage while their record is in flight, so at
/// most `max_elements` are outstanding; that bound also keeps the return
/// queue from overflowing.
pub struct IpcOutLink {
    input: InputQueue,
    channel: IpcChannel,
    remote: StageId,
    outputs: Arc<OutputQueues>,
    forward: Option<IpcQueue>,
    back: Option<IpcQueue>,
    doorbell: Option<Doorbell>,
    in_flight: HashMap<u32, BufferRef>,
    next_token: u32,
    element: Vec<u8>,
}

impl IpcOutLink {
    /// Forward `input` over `channel` to the IPC-in stage `remote`
    pub fn new(input: InputQueue, channel: IpcChannel, remote: StageId) -> Self {
        let element = vec![0u8; channel.config.element_size as usize];
        Self {
            input,
            channel,
            remote,
            outputs: Arc::new(OutputQueues::new()),
            forward: None,
            back: None,
            doorbell: None,
            in_flight: HashMap::new(),
            next_token: 0,
            element,
        }
    }

    /// Buffers whose records have not come back yet
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Collect buffers whose tokens came back
    fn drain_returns(&mut self, ctx: &StageContext, returns: &mut Vec<BufferRef>) -> Result<()> {
        let Some(back) = self.back.as_ref() else {
            return Ok(());
        };
        let mut token = [0u8; TOKEN_SIZE];
        loop {
            match back.read(&mut token) {
                Ok(()) => {
                    let token = u32::from_le_bytes(token);
                    match self.in_flight.remove(&token) {
                        Some(buf) => returns.push(buf),
                        None => tracing::error!(stage = %ctx.id(), token, "unknown token returned"),
                    }
                }
                Err(LinkError::Again) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    fn send(&mut self, buf: &BufferRef) -> Result<u32> {
        let (Some(forward), Some(_)) = (self.forward.as_ref(), self.back.as_ref()) else {
            return Err(LinkError::violation("ipc out used before create"));
        };
        if self.in_flight.len() >= self.channel.config.max_elements as usize {
            return Err(LinkError::Again);
        }
        let desc = buf.descriptor()?;
        let inline = if desc.payload_size as usize <= self.channel.inline_capacity() {
            let bytes = buf.with_payload(|p| p.to_vec())?;
            (bytes.len() == desc.payload_size as usize).then_some(bytes)
        } else {
            None
        };
        let token = self.next_token;
        ProxyRecord {
            token,
            desc,
            inline,
        }
        .encode(&mut self.element)?;
        forward.write(&self.element)?;
        self.next_token = self.next_token.wrapping_add(1);
        Ok(token)
    }

    /// Hand buffers back in lists of at most `max_in_list`
    ///
    /// Every buffer goes back even if one hand-off fails; the first error
    /// is reported.
    fn return_to_prev(&self, ctx: &StageContext, returns: Vec<BufferRef>) -> Result<()> {
        let capacity = ctx.config().buffers.max_in_list;
        let mut first_err = None;
        let mut returns = returns.into_iter().peekable();
        while returns.peek().is_some() {
            let mut list = BufferList::with_capacity(capacity)?;
            while !list.is_full() {
                let Some(buf) = returns.next() else { break };
                if let Err(buf) = list.push(buf) {
                    release_logged(ctx.id(), buf);
                }
            }
            if let Err(e) = ctx.put_empty_buffers(self.input.prev, self.input.queue, list) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl Link for IpcOutLink {
    fn name(&self) -> &str {
        "ipc-out"
    }

    fn ops(&self) -> Arc<dyn LinkOps> {
        self.outputs.clone()
    }

    fn create(&mut self, ctx: &StageContext) -> Result<()> {
        if self.channel.config != ctx.config().ipc {
            return Err(LinkError::Config(format!(
                "ipc channel geometry {:?} differs from the system config {:?}",
                self.channel.config,
                ctx.config().ipc
            )));
        }
        let prev_info = self.input.validate(ctx.registry())?;
        let cfg = self.channel.config;
        let forward = IpcQueue::create(
            cfg.max_elements,
            Arc::clone(&self.channel.forward),
            cfg.element_size,
        )?;
        let back = IpcQueue::create(
            cfg.max_elements,
            Arc::clone(&self.channel.back),
            cfg.element_size,
        )?;

        // Publish the predecessor's queue so the far side can validate against it
        let info = LinkInfo {
            queues: vec![prev_info.queue(self.input.queue)?.clone()],
        };
        self.outputs
            .open(ctx.id(), info, 1, ctx.config().buffers.max_in_list)?;
        self.forward = Some(forward);
        self.back = Some(back);
        self.doorbell = Some(Doorbell::new(Arc::clone(ctx.registry()), self.remote));
        self.next_token = 0;
        Ok(())
    }

    fn process(&mut self, ctx: &StageContext) -> Result<()> {
        let mut returns = Vec::new();
        let pulled = self
            .drain_returns(ctx, &mut returns)
            .and_then(|()| ctx.get_full_buffers(self.input.prev, self.input.queue));
        let list = match pulled {
            Ok(list) => list,
            Err(e) => {
                if let Err(return_err) = self.return_to_prev(ctx, returns) {
                    tracing::debug!(
                        stage = %ctx.id(),
                        error = %return_err,
                        "returned buffers released directly"
                    );
                }
                return Err(e);
            }
        };
        let mut sent = 0;
        for buf in list {
            match self.send(&buf) {
                Ok(token) => {
                    self.in_flight.insert(token, buf);
                    sent += 1;
                }
                Err(e) => {
                    if e.is_retryable() {
                        tracing::trace!(stage = %ctx.id(), "forward queue full, buffer dropped");
                    } else {
                        tracing::error!(
                            stage = %ctx.id(),
                            error = %e,
                            "send failed, buffer dropped"
                        );
                    }
                    ctx.stats().record_dropped(1);
                    returns.push(buf);
                }
            }
        }

        self.return_to_prev(ctx, returns)?;
        if sent > 0 {
            ctx.stats().record_forwarded(sent);
            if let Some(doorbell) = &self.doorbell {
                doorbell.ring()?;
            }
        }
        Ok(())
    }

    fn delete(&mut self, ctx: &StageContext) -> Result<()> {
        let mut returns = Vec::new();
        let drained = self.drain_returns(ctx, &mut returns);
        if !self.in_flight.is_empty() {
            tracing::warn!(
                stage = %ctx.id(),
                outstanding = self.in_flight.len(),
                "reclaiming buffers still in flight"
            );
        }
        returns.extend(self.in_flight.drain().map(|(_, buf)| buf));
        let returned = self.return_to_prev(ctx, returns);
        for buf in self.outputs.close() {
            release_logged(ctx.id(), buf);
        }
        let forward = self.forward.take().map_or(Ok(()), |q| q.delete());
        let back = self.back.take().map_or(Ok(()), |q| q.delete());
        self.doorbell = None;
        drained.and(returned).and(forward).and(back)
    }
}

/// Receiving half of an IPC link pair
///
/// Publishes one output queue of local proxy descriptors. Inline payloads
/// are copied into the proxy; larger ones are referenced by address.
pub struct IpcInLink {
    channel: IpcChannel,
    remote: StageId,
    next: Option<StageId>,
    num_proxies: usize,
    outputs: Arc<OutputQueues>,
    forward: Option<IpcQueue>,
    pool: Option<Arc<BufferPool>>,
    starved: Arc<AtomicBool>,
    element: Vec<u8>,
    epoch: Instant,
}

impl IpcInLink {
    /// Receive from the IPC-out stage `remote` over `channel`, with
    /// `num_proxies` local descriptors, waking `next`
    pub fn new(
        channel: IpcChannel,
        remote: StageId,
        next: Option<StageId>,
        num_proxies: usize,
    ) -> Self {
        let element = vec![0u8; channel.config.element_size as usize];
        Self {
            channel,
            remote,
            next,
            num_proxies,
            outputs: Arc::new(OutputQueues::new()),
            forward: None,
            pool: None,
            starved: Arc::new(AtomicBool::new(false)),
            element,
            epoch: Instant::now(),
        }
    }

    fn fill_proxy(&self, proxy: &BufferRef, record: ProxyRecord, now: u64) -> Result<()> {
        match record.inline {
            Some(bytes) => {
                proxy.with_payload_mut(|p| {
                    let n = bytes.len().min(p.len());
                    p[..n].copy_from_slice(&bytes[..n]);
                })?;
                let remote = record.desc;
                proxy.update(|d| {
                    *d = BufferDescriptor {
                        payload_addr: d.payload_addr,
                        local_timestamp: now,
                        ..remote
                    }
                })
            }
            None => {
                let remote = record.desc;
                proxy.update(|d| {
                    *d = BufferDescriptor {
                        local_timestamp: now,
                        ..remote
                    }
                })
            }
        }
    }

    fn receive(
        &mut self,
        ctx: &StageContext,
        forward: &IpcQueue,
        pool: &Arc<BufferPool>,
    ) -> Result<usize> {
        let mut received = 0;
        while !forward.is_empty()? {
            let Some(proxy) = pool.acquire() else {
                tracing::trace!(stage = %ctx.id(), "no free proxy, records left queued");
                self.starved.store(true, Ordering::Release);
                break;
            };
            // A proxy without a token goes back without touching the return queue
            let tagged = forward
                .read(&mut self.element)
                .and_then(|()| ProxyRecord::peek_token(&self.element))
                .and_then(|token| proxy.set_private(ctx.id(), u64::from(token)).map(|()| token));
            let token = match tagged {
                Ok(token) => token,
                Err(e) => {
                    release_logged(ctx.id(), proxy);
                    return Err(e);
                }
            };

            let now = self.epoch.elapsed().as_micros() as u64;
            let filled = ProxyRecord::decode(&self.element)
                .and_then(|r| self.fill_proxy(&proxy, r, now));
            if let Err(e) = filled {
                tracing::error!(
                    stage = %ctx.id(),
                    token,
                    error = %e,
                    "bad proxy record, returned unprocessed"
                );
                ctx.stats().record_dropped(1);
                release_logged(ctx.id(), proxy);
                continue;
            }
            match self.outputs.push(0, proxy) {
                Ok(()) => received += 1,
                Err(proxy) => {
                    ctx.stats().record_dropped(1);
                    release_logged(ctx.id(), proxy);
                }
            }
        }
        Ok(received)
    }
}

impl Link for IpcInLink {
    fn name(&self) -> &str {
        "ipc-in"
    }

    fn ops(&self) -> Arc<dyn LinkOps> {
        self.outputs.clone()
    }

    fn create(&mut self, ctx: &StageContext) -> Result<()> {
        let info = InputQueue::new(self.remote, 0).validate(ctx.registry())?;
        let forward = IpcQueue::reset(Arc::clone(&self.channel.forward), true, false)?;
        let back = Arc::new(IpcQueue::reset(Arc::clone(&self.channel.back), false, true)?);
        if forward.element_size() != self.channel.config.element_size
            || forward.max_elements() != self.channel.config.max_elements
        {
            return Err(LinkError::invalid(format!(
                "forward queue is {}x{}, channel expects {}x{}",
                forward.max_elements(),
                forward.element_size(),
                self.channel.config.max_elements,
                self.channel.config.element_size
            )));
        }

        let pool = BufferPool::new(
            ctx.id(),
            self.num_proxies,
            self.channel.inline_capacity(),
            Arc::clone(ctx.allocator()),
            PoolId::SHARED,
            ctx.config().buffers.max_derived,
        )?;
        let owner = ctx.id();
        let doorbell = Doorbell::new(Arc::clone(ctx.registry()), self.remote);
        let wake_self = Doorbell::new(Arc::clone(ctx.registry()), owner);
        let starved = Arc::clone(&self.starved);
        pool.set_recycle_hook(move |recycled| {
            // Records were left queued for lack of a proxy; one is free now
            if starved.swap(false, Ordering::AcqRel) {
                if let Err(e) = wake_self.ring() {
                    tracing::debug!(stage = %owner, error = %e, "could not resume draining");
                }
            }
            let Some(token) = recycled.private(owner) else {
                return;
            };
            let token = (token as u32).to_le_bytes();
            if let Err(e) = back.write(&token) {
                tracing::error!(stage = %owner, error = %e, "token return failed");
                return;
            }
            if let Err(e) = doorbell.ring() {
                tracing::debug!(stage = %owner, error = %e, "sender gone, token left queued");
            }
        });

        self.outputs
            .open(ctx.id(), info, self.num_proxies, ctx.config().buffers.max_in_list)?;
        self.forward = Some(forward);
        self.pool = Some(pool);
        Ok(())
    }

    fn process(&mut self, ctx: &StageContext) -> Result<()> {
        let (Some(forward), Some(pool)) = (self.forward.take(), self.pool.clone()) else {
            return Err(LinkError::violation("ipc in processing before create"));
        };
        let received = self.receive(ctx, &forward, &pool);
        self.forward = Some(forward);
        let received = received?;

        ctx.stats().record_received(received);
        if received > 0 {
            ctx.stats().record_forwarded(received);
            if let Some(next) = self.next {
                ctx.notify(next)?;
            }
        }
        Ok(())
    }

    fn delete(&mut self, ctx: &StageContext) -> Result<()> {
        for proxy in self.outputs.close() {
            release_logged(ctx.id(), proxy);
        }
        self.forward = None;
        self.pool = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(inline: Option<Vec<u8>>) -> ProxyRecord {
        ProxyRecord {
            token: 0xA5A5_0001,
            desc: BufferDescriptor {
                buf_type: BufferType::Bitstream,
                ch_num: 7,
                src_timestamp: 1 << 40,
                local_timestamp: 99,
                payload_size: inline.as_ref().map_or(4096, |b| b.len() as u32),
                payload_addr: 0x8000_1000,
                flags: 3,
            },
            inline,
        }
    }

    #[test]
    fn test_record_with_inline_payload() {
        let rec = record(Some(vec![1, 2, 3, 4, 5]));
        let mut element = vec![0xFFu8; 64];
        assert_eq!(rec.encode(&mut element).unwrap(), PROXY_HEADER_SIZE + 5);
        assert_eq!(ProxyRecord::peek_token(&element).unwrap(), 0xA5A5_0001);
        assert_eq!(ProxyRecord::decode(&element).unwrap(), rec);
    }

    #[test]
    fn test_record_by_reference() {
        let rec = record(None);
        let mut element = vec![0u8; PROXY_HEADER_SIZE];
        rec.encode(&mut element).unwrap();
        let decoded = ProxyRecord::decode(&element).unwrap();
        assert_eq!(decoded.inline, None);
        assert_eq!(decoded.desc.payload_addr, 0x8000_1000);
        assert_eq!(decoded.desc.payload_size, 4096);
    }

    #[test]
    fn test_record_too_large_for_element() {
        let rec = record(Some(vec![0; 17]));
        let mut element = vec![0u8; 64];
        assert!(matches!(
            rec.encode(&mut element),
            Err(LinkError::InvalidParams(_))
        ));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let mut element = vec![0u8; 64];
        element[4] = 9;
        assert!(ProxyRecord::decode(&element).is_err());

        let mut element = vec![0u8; 64];
        element[5] = FLAG_INLINE;
        element[12..16].copy_from_slice(&100u32.to_le_bytes());
        assert!(ProxyRecord::decode(&element).is_err());
        assert!(ProxyRecord::decode(&element[..20]).is_err());
    }

    #[test]
    fn test_channel_rejects_small_elements() {
        let config = IpcConfig {
            max_elements: 4,
            element_size: 16,
        };
        assert!(matches!(IpcChannel::new(&config), Err(LinkError::Config(_))));
        let config = IpcConfig {
            max_elements: 4,
            element_size: 64,
        };
        assert_eq!(IpcChannel::new(&config).unwrap().inline_capacity(), 16);
    }

    #[test]
    fn test_returned_buffers_go_home_when_producer_is_gone() {
        use crate::config::SystemConfig;
        use crate::mailbox::Mailbox;
        use crate::memory::HeapAllocator;
        use crate::registry::QueueInfo;

        let registry = Arc::new(StageRegistry::new());
        let allocator = Arc::new(HeapAllocator::new());
        let config = SystemConfig::default();
        let prev = StageId::new(0, 1);
        let remote = StageId::new(1, 1);

        let producer = Arc::new(OutputQueues::new());
        producer
            .open(
                prev,
                LinkInfo {
                    queues: vec![QueueInfo::default()],
                },
                4,
                4,
            )
            .unwrap();
        registry
            .register(prev, producer.clone(), Mailbox::new(prev, 4).unwrap())
            .unwrap();
        registry
            .register(
                remote,
                Arc::new(OutputQueues::new()),
                Mailbox::new(remote, 4).unwrap(),
            )
            .unwrap();
        let pool = BufferPool::new(prev, 2, 0, allocator.clone(), PoolId::FRAME, 0).unwrap();
        for _ in 0..2 {
            producer.push(0, pool.acquire().unwrap()).unwrap();
        }

        let channel = IpcChannel::new(&config.ipc).unwrap();
        let ctx = StageContext::new(StageId::new(0, 2), Arc::clone(&registry), config, allocator);
        let mut link = IpcOutLink::new(InputQueue::new(prev, 0), channel.clone(), remote);
        link.create(&ctx).unwrap();
        link.process(&ctx).unwrap();
        assert_eq!(link.in_flight(), 2);
        assert_eq!(pool.status().free, 0);

        // Far side consumes both records and hands the tokens back
        let forward = IpcQueue::reset(Arc::clone(channel.forward_region()), false, false).unwrap();
        let back = IpcQueue::reset(Arc::clone(channel.return_region()), false, false).unwrap();
        let mut element = vec![0u8; channel.config().element_size as usize];
        for _ in 0..2 {
            forward.read(&mut element).unwrap();
            let token = ProxyRecord::peek_token(&element).unwrap();
            back.write(&token.to_le_bytes()).unwrap();
        }

        registry.unregister(prev).unwrap();
        assert!(matches!(
            link.process(&ctx),
            Err(LinkError::NotRegistered(_))
        ));
        assert_eq!(link.in_flight(), 0);
        assert_eq!(pool.status().free, 2);
        assert_eq!(pool.status().recycled, 2);
    }

    #[test]
    fn test_doorbell_rings_registered_stage() {
        use crate::mailbox::{Command, Mailbox};

        struct Quiet;
        impl LinkOps for Quiet {
            fn get_full_buffers(&self, _queue: usize) -> Result<BufferList> {
                Ok(BufferList::new())
            }
            fn put_empty_buffers(&self, _queue: usize, _list: BufferList) -> Result<()> {
                Ok(())
            }
            fn link_info(&self) -> LinkInfo {
                LinkInfo::default()
            }
        }

        let registry = Arc::new(StageRegistry::new());
        let id = StageId::new(1, 2);
        let mailbox = Mailbox::new(id, 1).unwrap();
        registry.register(id, Arc::new(Quiet), mailbox.clone()).unwrap();
        let bell = Doorbell::new(Arc::clone(&registry), id);
        bell.ring().unwrap();
        bell.ring().unwrap();
        assert_eq!(bell.rings(), 2);
        assert_eq!(mailbox.pending(), 1);
        assert_eq!(mailbox.try_recv().map(|m| m.command()), Some(Command::NewData));

        registry.unregister(id).unwrap();
        assert!(matches!(bell.ring(), Err(LinkError::NotRegistered(_))));
    }
}
