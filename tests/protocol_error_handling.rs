use tidelink::{
    BitWriter, BufferedTransport, BunchHeader, ChannelName, CloseCause, Connection,
    ConnectionConfig, ConnectionEvent, ConnectionState, HostType, PacketIndex,
    PacketNotifyHeader, ProtocolViolation, Serde, SequenceHistory,
};

/// Assembles a wire packet by hand, the way a misbehaving peer would.
/// A fresh connection expects incoming sequence 0 and has acked nothing.
fn craft_packet(seq: PacketIndex, bunches: &[(BunchHeader, &[u8])]) -> Box<[u8]> {
    let mut writer = BitWriter::new();
    PacketNotifyHeader {
        seq,
        acked_seq: PacketIndex::MAX,
        history: SequenceHistory::new(),
    }
    .ser(&mut writer);
    false.ser(&mut writer); // no piggybacked packet info
    for (header, payload) in bunches {
        header.ser(&mut writer);
        writer.write_bits(payload, header.payload_bits);
    }
    writer.to_packet()
}

fn control_open_header() -> BunchHeader {
    BunchHeader {
        open: true,
        reliable: true,
        wrapped_reliable_seq: 1,
        channel_name: Some(ChannelName::Control),
        ..Default::default()
    }
}

fn close_cause(connection: &mut Connection) -> Option<CloseCause> {
    connection
        .take_events()
        .into_iter()
        .find_map(|event| match event {
            ConnectionEvent::Closed { cause } => Some(cause),
            _ => None,
        })
}

#[cfg(test)]
mod malformed_packet_tests {
    use super::*;

    #[test]
    fn packet_without_termination_marker_closes() {
        let mut server = Connection::new(HostType::Server, ConnectionConfig::default());
        let mut io = BufferedTransport::new();

        server.received_raw_packet(&[0, 0, 0, 0], &mut io);

        assert_eq!(server.state(), ConnectionState::Closed);
        assert_eq!(
            close_cause(&mut server),
            Some(CloseCause::Violation(ProtocolViolation::MalformedPacket {
                byte_len: 4
            }))
        );
    }

    #[test]
    fn packet_shorter_than_the_notify_header_closes() {
        let mut server = Connection::new(HostType::Server, ConnectionConfig::default());
        let mut io = BufferedTransport::new();

        // a valid termination marker but only 16 bits of content
        let mut writer = BitWriter::new();
        0u16.ser(&mut writer);
        server.received_raw_packet(&writer.to_packet(), &mut io);

        assert_eq!(server.state(), ConnectionState::Closed);
        assert_eq!(
            close_cause(&mut server),
            Some(CloseCause::Violation(
                ProtocolViolation::MalformedNotifyHeader
            ))
        );
    }

    #[test]
    fn bunch_claiming_more_payload_than_the_packet_holds_closes() {
        let mut server = Connection::new(HostType::Server, ConnectionConfig::default());
        let mut io = BufferedTransport::new();

        let mut lying = control_open_header();
        lying.payload_bits = 5000;
        // header written, payload withheld
        let mut writer = BitWriter::new();
        PacketNotifyHeader {
            seq: 0,
            acked_seq: PacketIndex::MAX,
            history: SequenceHistory::new(),
        }
        .ser(&mut writer);
        false.ser(&mut writer);
        lying.ser(&mut writer);
        server.received_raw_packet(&writer.to_packet(), &mut io);

        assert_eq!(server.state(), ConnectionState::Closed);
        assert!(matches!(
            close_cause(&mut server),
            Some(CloseCause::Violation(
                ProtocolViolation::BunchDataOverflow { claimed_bits: 5000, .. }
            ))
        ));
    }
}

#[cfg(test)]
mod channel_violation_tests {
    use super::*;

    #[test]
    fn bunch_for_out_of_bounds_channel_closes_without_opening() {
        let mut server = Connection::new(HostType::Server, ConnectionConfig::default());
        let mut io = BufferedTransport::new();

        let mut header = control_open_header();
        header.channel_index = 40;
        header.channel_name = Some(ChannelName::Voice);
        let packet = craft_packet(0, &[(header, &[])]);
        server.received_raw_packet(&packet, &mut io);

        assert_eq!(server.state(), ConnectionState::Closed);
        let events = server.take_events();
        assert!(
            !events
                .iter()
                .any(|event| matches!(event, ConnectionEvent::ChannelOpened { .. })),
            "the offending bunch must not create a channel"
        );
        assert!(events.iter().any(|event| matches!(
            event,
            ConnectionEvent::Closed {
                cause: CloseCause::Violation(ProtocolViolation::ChannelIndexOutOfBounds {
                    channel_index: 40,
                    max_channels: 32,
                })
            }
        )));
    }

    #[test]
    fn data_bunch_before_the_control_channel_closes() {
        let mut server = Connection::new(HostType::Server, ConnectionConfig::default());
        let mut io = BufferedTransport::new();

        let mut header = control_open_header();
        header.channel_index = 3;
        header.channel_name = Some(ChannelName::Voice);
        let packet = craft_packet(0, &[(header, &[])]);
        server.received_raw_packet(&packet, &mut io);

        assert_eq!(
            close_cause(&mut server),
            Some(CloseCause::Violation(
                ProtocolViolation::BunchBeforeControlChannel { channel_index: 3 }
            ))
        );
    }

    #[test]
    fn bunch_naming_the_wrong_channel_type_closes() {
        let mut server = Connection::new(HostType::Server, ConnectionConfig::default());
        let mut client = Connection::new(HostType::Client, ConnectionConfig::default());
        let mut server_io = BufferedTransport::new();
        let mut client_io = BufferedTransport::new();

        client
            .open_channel(ChannelName::Control, &mut client_io)
            .unwrap();
        let voice = client
            .open_channel(ChannelName::Voice, &mut client_io)
            .unwrap();
        client.flush_net(&mut client_io);
        for (bytes, _, _) in client_io.take_sent() {
            server.received_raw_packet(&bytes, &mut server_io);
        }
        assert_eq!(server.state(), ConnectionState::Open);

        // same index, different claimed type
        let mut header = BunchHeader {
            reliable: true,
            wrapped_reliable_seq: 2,
            channel_name: Some(ChannelName::Actor),
            ..Default::default()
        };
        header.channel_index = voice;
        let packet = craft_packet(1, &[(header, &[])]);
        server.received_raw_packet(&packet, &mut server_io);

        assert_eq!(server.state(), ConnectionState::Closed);
        assert!(matches!(
            close_cause(&mut server),
            Some(CloseCause::Violation(
                ProtocolViolation::ChannelNameMismatch { .. }
            ))
        ));
    }

    #[test]
    fn control_channel_close_before_open_closes() {
        let mut server = Connection::new(HostType::Server, ConnectionConfig::default());
        let mut io = BufferedTransport::new();

        let header = BunchHeader {
            close: true,
            ..Default::default()
        };
        let packet = craft_packet(0, &[(header, &[])]);
        server.received_raw_packet(&packet, &mut io);

        assert_eq!(
            close_cause(&mut server),
            Some(CloseCause::Violation(
                ProtocolViolation::ControlChannelCloseBeforeOpen
            ))
        );
    }
}

#[cfg(test)]
mod abuse_tests {
    use super::*;

    #[test]
    fn sustained_rejected_bunches_close_for_abuse() {
        let mut config = ConnectionConfig::default();
        config.abuse_close_threshold = 3;
        let mut server = Connection::new(HostType::Server, config);
        let mut io = BufferedTransport::new();

        // one valid control open, then a flood of bunches for a channel
        // that does not exist and is never opened
        let mut bunches: Vec<(BunchHeader, &[u8])> = vec![(control_open_header(), &[][..])];
        for _ in 0..5 {
            let mut header = BunchHeader::default();
            header.channel_index = 7;
            bunches.push((header, &[]));
        }
        let packet = craft_packet(0, &bunches);
        server.received_raw_packet(&packet, &mut io);

        assert_eq!(server.state(), ConnectionState::Closed);
        assert!(matches!(
            close_cause(&mut server),
            Some(CloseCause::Abuse { .. })
        ));
    }
}

#[cfg(test)]
mod permission_tests {
    use super::*;

    #[test]
    fn client_opening_a_server_only_channel_is_refused_not_fatal() {
        let mut server = Connection::new(HostType::Server, ConnectionConfig::default());
        let mut client = Connection::new(HostType::Client, ConnectionConfig::default());
        let mut server_io = BufferedTransport::new();
        let mut client_io = BufferedTransport::new();

        client
            .open_channel(ChannelName::Control, &mut client_io)
            .unwrap();
        let actor = client
            .open_channel(ChannelName::Actor, &mut client_io)
            .unwrap();
        client.flush_net(&mut client_io);
        for (bytes, _, _) in client_io.take_sent() {
            server.received_raw_packet(&bytes, &mut server_io);
        }

        // the connection survives; only the channel is refused
        assert_eq!(server.state(), ConnectionState::Open);
        let server_events = server.take_events();
        assert!(
            !server_events.iter().any(|event| matches!(
                event,
                ConnectionEvent::ChannelOpened { channel_index, .. } if *channel_index == actor
            )),
            "an actor channel may only be opened by the server"
        );

        // the refusal travels back as a close bunch for that index
        server.flush_net(&mut server_io);
        for (bytes, _, _) in server_io.take_sent() {
            client.received_raw_packet(&bytes, &mut client_io);
        }
        assert_eq!(client.state(), ConnectionState::Open);
        assert!(client
            .take_events()
            .contains(&ConnectionEvent::ChannelClosed {
                channel_index: actor
            }));
    }
}

#[cfg(test)]
mod error_display_tests {
    use super::*;

    #[test]
    fn violations_describe_themselves() {
        assert_eq!(
            ProtocolViolation::ChannelIndexOutOfBounds {
                channel_index: 40,
                max_channels: 32,
            }
            .to_string(),
            "Bunch channel index 40 exceeds the channel limit 32"
        );
        assert_eq!(
            ProtocolViolation::MalformedPacket { byte_len: 4 }.to_string(),
            "Packet of 4 bytes has no valid termination marker. Truncated, corrupted or forged packet"
        );
        assert_eq!(
            ProtocolViolation::BunchDataOverflow {
                claimed_bits: 5000,
                remaining_bits: 12,
            }
            .to_string(),
            "Bunch claims 5000 payload bits but only 12 remain in the packet"
        );
    }
}
