use crate::membership::{Digest, View};
use crate::message::Address;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GmsType {
    JoinReq,
    JoinRsp,
    LeaveReq,
    LeaveRsp,
    View,
}

/// What a joiner needs to enter the group: the view that includes it and the
/// digest its NAKACK windows start from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRsp {
    pub view: View,
    pub digest: Digest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GmsHeader {
    pub kind: GmsType,
    pub mbr: Option<Address>,
    pub view: Option<View>,
    pub join_rsp: Option<JoinRsp>,
    pub digest: Option<Digest>,
}

impl GmsHeader {
    fn empty(kind: GmsType) -> Self {
        Self {
            kind,
            mbr: None,
            view: None,
            join_rsp: None,
            digest: None,
        }
    }

    pub fn join_req(mbr: Address) -> Self {
        Self {
            mbr: Some(mbr),
            ..Self::empty(GmsType::JoinReq)
        }
    }

    pub fn join_rsp(rsp: JoinRsp) -> Self {
        Self {
            join_rsp: Some(rsp),
            ..Self::empty(GmsType::JoinRsp)
        }
    }

    pub fn leave_req(mbr: Address) -> Self {
        Self {
            mbr: Some(mbr),
            ..Self::empty(GmsType::LeaveReq)
        }
    }

    pub fn leave_rsp() -> Self {
        Self::empty(GmsType::LeaveRsp)
    }

    pub fn view(view: View) -> Self {
        Self {
            view: Some(view),
            ..Self::empty(GmsType::View)
        }
    }
}
