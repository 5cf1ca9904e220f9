use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use async_trait::async_trait;
use tracing::{debug, info};
use crate::config::TransportArgs;
use crate::ctrl::{regs, RegisterIface};
use crate::error::TransportError;
use crate::factory::registry::TransportRegistry;
use crate::factory::TransportFactory;
use crate::sid::Sid;
use crate::xport::offload::RecvOffload;
use crate::xport::udp::UdpZeroCopy;
use crate::xport::{BothXports, XportPurpose, ZeroCopyTransport};

/// One of the device's network interfaces, as seen from the host
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EthInterface {
    /// the host address to bind, typically with port 0
    pub local: SocketAddr,
    /// the device's control port
    pub ctrl_addr: SocketAddr,
    /// the device's data port
    pub data_addr: SocketAddr,
}

/// Transports over UDP, using up to two of the device's network interfaces.
///
/// Control and async message streams always use the first interface. Data streams are spread
///  over the interfaces round-robin; for each new stream, the device's routing table is
///  programmed to send the stream's packets out on the chosen interface.
pub struct EthTransportFactory {
    interfaces: Vec<EthInterface>,
    /// routing table access - the control transport of the first interface
    routing: Arc<dyn RegisterIface>,
    next_interface: AtomicUsize,
    registry: TransportRegistry<Sid, BothXports>,
}

impl EthTransportFactory {
    pub const MAX_INTERFACES: usize = 2;

    pub fn new(interfaces: Vec<EthInterface>, routing: Arc<dyn RegisterIface>) -> anyhow::Result<EthTransportFactory> {
        if interfaces.is_empty() || interfaces.len() > Self::MAX_INTERFACES {
            return Err(TransportError::InvalidArgument(format!("expected 1 to {} network interfaces, got {}", Self::MAX_INTERFACES, interfaces.len())).into());
        }
        info!("Ethernet transport factory on {} interface(s): {:?}", interfaces.len(), interfaces.iter().map(|i| i.data_addr).collect::<Vec<_>>());

        Ok(EthTransportFactory {
            interfaces,
            routing,
            next_interface: AtomicUsize::new(0),
            registry: Default::default(),
        })
    }

    /// Make the device send packets with `recv_sid` out on interface `interface`, verifying the
    ///  entry by reading it back
    async fn program_route(&self, recv_sid: Sid, interface: usize) -> anyhow::Result<()> {
        let addr = regs::routing_entry(recv_sid.dst_endpoint());
        let expected = interface as u32;

        self.routing.poke32(addr, expected).await?;
        let actual = self.routing.peek32(addr).await?;
        if actual != expected {
            return Err(TransportError::RoutingNotAcknowledged { sid: recv_sid, expected, actual }.into());
        }
        debug!("routing {} to interface {}", recv_sid, interface);
        Ok(())
    }

    async fn connect(&self, sid: Sid, purpose: XportPurpose, args: &TransportArgs) -> anyhow::Result<BothXports> {
        let (interface, remote) = match purpose {
            XportPurpose::Ctrl | XportPurpose::AsyncMsg => (0, self.interfaces[0].ctrl_addr),
            XportPurpose::RxData | XportPurpose::TxData => {
                let interface = self.next_interface.fetch_add(1, Ordering::AcqRel) % self.interfaces.len();
                self.program_route(sid.reversed(), interface).await?;
                (interface, self.interfaces[interface].data_addr)
            }
        };

        let udp = Arc::new(UdpZeroCopy::connect(self.interfaces[interface].local, remote, args).await?);
        debug!("{:?} transport for {} on interface {}", purpose, sid, interface);

        let recv: Arc<dyn ZeroCopyTransport> = if purpose == XportPurpose::RxData && args.recv_offload {
            Arc::new(RecvOffload::new(udp.clone(), args.offload_queue_depth))
        }
        else {
            udp.clone()
        };

        Ok(BothXports {
            recv,
            recv_buff_size: udp.recv_buff_size(),
            send_buff_size: udp.send_buff_size(),
            send: udp,
            send_sid: sid,
            recv_sid: sid.reversed(),
        })
    }
}

#[async_trait]
impl TransportFactory for EthTransportFactory {
    async fn make_transport(&self, sid: Sid, purpose: XportPurpose, args: &TransportArgs) -> anyhow::Result<BothXports> {
        self.registry.get_or_allocate(sid, |_| self.connect(sid, purpose, args)).await
    }

    fn default_args(&self) -> TransportArgs {
        TransportArgs::default_eth()
    }

    async fn shutdown(&self) {
        let released = self.registry.release_all().await;
        debug!("released {} UDP transports", released.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;
    use mockall::predicate::{always, eq};
    use tokio::runtime::Builder;
    use tokio::sync::watch;
    use crate::async_msg::{AsyncMsgQueue, AsyncMsgRouter, AsyncMsgSink};
    use crate::config::StreamOptions;
    use crate::convert::{OtwFormat, Sc16};
    use crate::ctrl::MockRegisterIface;
    use crate::metadata::TxMetadata;
    use crate::packet::{Endianness, HeaderCodec, IfPacketInfo, PacketType};
    use crate::radio::MockRadioCtrl;
    use crate::streamer::{StreamChannel, StreamRates, StreamerSetup};
    use crate::streamer::tx::TxStreamer;
    use crate::util::buf_ext::BufMutExt;

    fn interface(device: &std::net::UdpSocket) -> EthInterface {
        EthInterface {
            local: "127.0.0.1:0".parse().unwrap(),
            ctrl_addr: device.local_addr().unwrap(),
            data_addr: device.local_addr().unwrap(),
        }
    }

    fn args() -> TransportArgs {
        TransportArgs {
            recv_buff_size: 64 * 1024,
            send_buff_size: 64 * 1024,
            ..TransportArgs::default_eth()
        }
    }

    fn sid(endpoint: u8) -> Sid {
        Sid::new(0x00, endpoint, 0x02, endpoint)
    }

    /// routing registers that read back what was written
    fn routing_table(writes: Arc<Mutex<Vec<(u32, u32)>>>) -> MockRegisterIface {
        let mut iface = MockRegisterIface::new();
        let w = writes.clone();
        iface.expect_poke32().returning(move |addr, data| {
            w.lock().unwrap().push((addr, data));
            Ok(())
        });
        iface.expect_peek32().returning(move |addr| {
            Ok(writes.lock().unwrap().iter().rev().find(|(a, _)| *a == addr).map(|(_, d)| *d).unwrap_or(u32::MAX))
        });
        iface
    }

    #[test]
    fn test_round_robin_routing() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let device_a = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
            let device_b = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
            let writes = Arc::new(Mutex::new(Vec::new()));
            let factory = EthTransportFactory::new(vec![interface(&device_a), interface(&device_b)], Arc::new(routing_table(writes.clone()))).unwrap();

            factory.make_transport(sid(0x00), XportPurpose::Ctrl, &args()).await.unwrap();
            for endpoint in [0x10, 0x11, 0x20] {
                let xports = factory.make_transport(sid(endpoint), XportPurpose::RxData, &args()).await.unwrap();
                assert_eq!(xports.recv_sid, sid(endpoint).reversed());
            }
            // known SIDs are not routed again
            factory.make_transport(sid(0x11), XportPurpose::RxData, &args()).await.unwrap();

            assert_eq!(writes.lock().unwrap().clone(), vec![
                (regs::routing_entry(0x10), 0),
                (regs::routing_entry(0x11), 1),
                (regs::routing_entry(0x20), 0),
            ]);
            factory.shutdown().await;
        });
    }

    #[test]
    fn test_routing_not_acknowledged() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let device = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
            let mut iface = MockRegisterIface::new();
            iface.expect_poke32().with(eq(regs::routing_entry(0x10)), always()).returning(|_, _| Ok(()));
            iface.expect_peek32().returning(|_| Ok(7));

            let factory = EthTransportFactory::new(vec![interface(&device)], Arc::new(iface)).unwrap();
            let err = factory.make_transport(sid(0x10), XportPurpose::TxData, &args()).await.unwrap_err();
            assert_eq!(err.downcast_ref::<TransportError>(), Some(&TransportError::RoutingNotAcknowledged {
                sid: sid(0x10).reversed(),
                expected: 0,
                actual: 7,
            }));
        });
    }

    #[test]
    fn test_interface_count() {
        let device = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        assert!(EthTransportFactory::new(vec![], Arc::new(MockRegisterIface::new())).is_err());
        assert!(EthTransportFactory::new(vec![interface(&device); 3], Arc::new(MockRegisterIface::new())).is_err());
    }

    /// Answers every data packet with a flow control response for it, the way the device does
    ///  for a TX stream with a response frequency of one packet
    async fn acknowledging_device(device: tokio::net::UdpSocket, codec: HeaderCodec) -> usize {
        let mut num_packets = 0;
        let mut buf = vec![0u8; 2048];
        while let Ok(Ok((len, from))) = tokio::time::timeout(Duration::from_secs(1), device.recv_from(&mut buf)).await {
            let info = codec.unpack(&buf[..len]).unwrap();
            num_packets += 1;

            let mut fc = IfPacketInfo::new(PacketType::FlowControl, info.sid.unwrap().reversed());
            fc.num_payload_bytes = 8;
            let mut frame = Vec::new();
            codec.pack(&mut fc, &mut frame).unwrap();
            frame.put_word32(0, codec.endianness);
            frame.put_word32(info.packet_count as u32, codec.endianness);
            device.send_to(&frame, from).await.unwrap();
        }
        num_packets
    }

    #[test]
    fn test_tx_stream_beyond_window() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let device = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
            let factory = EthTransportFactory::new(vec![interface(&device)], Arc::new(routing_table(Arc::default()))).unwrap();
            device.set_nonblocking(true).unwrap();
            let codec = HeaderCodec::chdr(Endianness::Big);
            let device = tokio::spawn(acknowledging_device(tokio::net::UdpSocket::from_std(device).unwrap(), codec));

            let xports = factory.make_transport(sid(0x10), XportPurpose::TxData, &args()).await.unwrap();
            let frame_size = xports.send.send_frame_size();

            let mut radio = MockRadioCtrl::new();
            radio.expect_setup_tx_flow_control().returning(|_, _, _| Ok(()));
            let (_tick_tx, tick_rate) = watch::channel(100e6);
            let sink = AsyncMsgSink {
                codec,
                tick_rate,
                queue: Arc::new(AsyncMsgQueue::new(8)),
                router: Arc::new(AsyncMsgRouter::default()),
                poll_interval: Duration::from_millis(100),
            };
            let setup = StreamerSetup {
                codec,
                otw_format: OtwFormat::Sc16,
                rates: StreamRates { tick_rate: 100e6, samp_rate: 1e6 },
                options: StreamOptions::default(),
            };

            // the device buffers two packets
            let streamer = TxStreamer::<Sc16>::new(setup, vec![StreamChannel { channel: 0, xports }], Arc::new(radio), sink, 2 * frame_size)
                .await
                .unwrap();

            let samples = vec![Sc16::default(); 10 * streamer.max_num_samps()];
            let md = TxMetadata { end_of_burst: true, ..TxMetadata::default() };
            assert_eq!(streamer.send(&[&samples[..]], &md, Duration::from_secs(2)).await.unwrap(), samples.len());

            assert_eq!(device.await.unwrap(), 10);
            drop(streamer);
            factory.shutdown().await;
        });
    }
}
