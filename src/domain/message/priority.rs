/// When a freshly enqueued message may go out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageTransmissionPriority {
    SendImmediately,
    SendAfterRegistrationAccepted,
    Discard,
}

/// Boot, triggered and post-registration traffic goes out at once. Before
/// registration only transaction messages (or everything, with
/// `queue_all_messages`) are held; the rest is dropped.
pub fn get_message_transmission_priority(
    is_boot_notification: bool,
    triggered: bool,
    registration_accepted: bool,
    is_transaction_related: bool,
    queue_all_messages: bool,
) -> MessageTransmissionPriority {
    if registration_accepted || is_boot_notification || triggered {
        return MessageTransmissionPriority::SendImmediately;
    }

    if is_transaction_related || queue_all_messages {
        return MessageTransmissionPriority::SendAfterRegistrationAccepted;
    }

    MessageTransmissionPriority::Discard
}

#[cfg(test)]
mod tests {
    use super::MessageTransmissionPriority::*;
    use super::*;

    #[test]
    fn boot_and_triggered_bypass_gating() {
        assert_eq!(
            get_message_transmission_priority(true, false, false, false, false),
            SendImmediately
        );
        assert_eq!(
            get_message_transmission_priority(false, true, false, false, false),
            SendImmediately
        );
        assert_eq!(
            get_message_transmission_priority(false, false, true, false, false),
            SendImmediately
        );
    }

    #[test]
    fn transaction_messages_are_held_before_registration() {
        assert_eq!(
            get_message_transmission_priority(false, false, false, true, false),
            SendAfterRegistrationAccepted
        );
    }

    #[test]
    fn queue_all_holds_everything() {
        assert_eq!(
            get_message_transmission_priority(false, false, false, false, true),
            SendAfterRegistrationAccepted
        );
    }

    #[test]
    fn other_traffic_is_discarded_before_registration() {
        assert_eq!(get_message_transmission_priority(false, false, false, false, false), Discard);
    }
}
