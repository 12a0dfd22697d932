//! Call transfer requested by the peer (RFC 3515)

use super::dial::Dialer;
use super::error::Result;
use super::events::ReferState;
use super::phone::respond;
use super::session::{Dialog, DialogClientSession};
use crate::domain::shared::SipUri;
use crate::infrastructure::protocols::sip::builder::contact_value;
use crate::infrastructure::protocols::sip::{
    ResponseBuilder, ServerTransaction, SipMethod, SipResponse,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

const SIPFRAG: &str = "message/sipfrag;version=2.0";

impl Dialer {
    pub(super) async fn on_refer(self: Arc<Self>, tx: ServerTransaction) {
        let events = match self.options.events.clone() {
            Some(events) if events.handles_refer() => events,
            _ => {
                debug!("REFER not handled");
                respond(&tx, ResponseBuilder::new(405));
                return;
            }
        };

        let Some(dialog) = self.cache.match_request(tx.request()) else {
            info!(call_id = ?tx.request().call_id(), "REFER outside the call");
            respond(&tx, ResponseBuilder::new(481));
            return;
        };

        let target = match check_refer(&dialog, &tx) {
            Ok(target) => target,
            Err(rejection) => {
                warn!(status = rejection.code, reason = %rejection.reason, "REFER rejected");
                respond(&tx, ResponseBuilder::new(rejection.code).reason(rejection.reason));
                events.on_refer(ReferState::Ended);
                return;
            }
        };

        if let Err(e) = tx.respond(ResponseBuilder::new(202).build_for_request(tx.request())) {
            warn!(error = %e, "Failed to accept REFER");
            events.on_refer(ReferState::Ended);
            return;
        }
        events.on_refer(ReferState::Initiated);

        let span = info_span!("refer", refer_to = %target);
        match self.transfer(dialog, target).instrument(span).await {
            Ok(session) => {
                info!(call_id = %session.id().call_id, "Transfer confirmed");
                events.on_refer(ReferState::Confirmed(session));
            }
            Err(e) => {
                warn!(error = %e, "Transfer failed");
                // Already answered 202, so the transaction drops this
                respond(&tx, ResponseBuilder::new(500).reason(e.to_string()));
                events.on_refer(ReferState::Ended);
            }
        }
    }

    async fn transfer(&self, dialog: Arc<Dialog>, target: SipUri) -> Result<DialogClientSession> {
        let contact = self.cache.contact().clone();
        let accepted = match notify(&dialog, &contact, "SIP/2.0 100 Trying", false).await {
            Ok(response) => response.is_success(),
            Err(e) => {
                warn!(error = %e, "NOTIFY failed");
                false
            }
        };

        info!(uri = %target, "Dialing transfer target");
        let cancel = CancellationToken::new();
        let session = self
            .phone
            .dial_boxed(&cancel, target, self.options.clone())
            .await?;

        if accepted {
            tokio::spawn(async move {
                if let Err(e) = notify(&dialog, &contact, "SIP/2.0 200 OK", true).await {
                    warn!(error = %e, "Final NOTIFY failed");
                }
            });
        }
        Ok(session)
    }
}

struct Rejection {
    code: u16,
    reason: String,
}

impl Rejection {
    fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// In-sequence CSeq and a usable Refer-To target
fn check_refer(dialog: &Dialog, tx: &ServerTransaction) -> std::result::Result<SipUri, Rejection> {
    let request = tx.request();
    let cseq = request.cseq().unwrap_or(0);
    // RFC 3261 12.2.2: a lower CSeq is answered 500
    if !dialog.accept_remote_seq(cseq) {
        return Err(Rejection::new(500, format!("CSeq {} is out of order", cseq)));
    }

    let refer_to = request
        .header("refer-to")
        .ok_or_else(|| Rejection::new(400, "Missing Refer-To"))?;
    SipUri::from_name_addr(&refer_to).map_err(|e| {
        debug!(error = %e, refer_to = %refer_to, "Unparsable Refer-To");
        Rejection::new(400, "Bad Refer-To")
    })
}

/// Report transfer progress on the original dialog
async fn notify(dialog: &Dialog, contact: &SipUri, frag: &str, last: bool) -> Result<SipResponse> {
    let mut request = dialog.request(SipMethod::Notify)?;
    request.set_header("Event", "refer");
    request.set_header(
        "Subscription-State",
        if last { "terminated;reason=noresource" } else { "active" },
    );
    request.set_header("Contact", contact_value(contact));
    request.set_body(SIPFRAG, frag.as_bytes().to_vec());

    debug!(frag, "Sending NOTIFY");
    let mut tx = dialog.send(request).await?;
    Ok(tx.final_response(&CancellationToken::new(), |_| {}).await?)
}
