//! Method routing.
//!
//! Which methods a pool answers depends on the handshake its chain's miners
//! use. Unknown (family, method) pairs route nowhere and the message is
//! dropped.

/// Handshake families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ChainFamily {
    /// `mining.subscribe`, `mining.authorize`, `mining.submit`.
    BtcStyle,
    /// `mining.subscribe` doubles as login.
    Cfx,
    /// `eth_submitLogin`, `eth_getWork`, `eth_submitWork`.
    Eth,
}

impl ChainFamily {
    pub fn of(chain: &str) -> Option<Self> {
        match chain.to_ascii_uppercase().as_str() {
            "ERG" | "ERGO" | "FIRO" | "FLUX" | "KAS" | "NEXA" | "RVN" => Some(Self::BtcStyle),
            "CFX" => Some(Self::Cfx),
            "ETH" | "ETC" => Some(Self::Eth),
            _ => None,
        }
    }
}

/// What to do with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Handler {
    Subscribe,
    Login,
    Submit,
    ExtranonceSubscribe,
    /// Hashrate reports are acknowledged and otherwise ignored.
    SubmitHashrate,
    GetWork,
}

/// Pick the handler for `method` under `family`.
pub fn route(family: ChainFamily, method: &str) -> Option<Handler> {
    use ChainFamily::*;
    use Handler::*;

    let handler = match (family, method) {
        (BtcStyle, "mining.subscribe") => Subscribe,
        (BtcStyle, "mining.authorize") => Login,
        (BtcStyle | Cfx, "mining.submit") => Submit,
        (BtcStyle | Cfx, "mining.extranonce.subscribe") => ExtranonceSubscribe,
        (BtcStyle | Eth, "eth_submitHashrate") => SubmitHashrate,
        (Cfx, "mining.subscribe") => Login,
        (Eth, "eth_submitLogin") => Login,
        (Eth, "eth_submitWork") => Submit,
        (Eth, "eth_getWork") => GetWork,
        _ => return None,
    };
    Some(handler)
}
