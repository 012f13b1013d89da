//! Record data served by the registry.
//!
//! The registry serves a closed set of record types: address records and
//! CNAMEs projected from registration payloads, URI records ([RFC 7553])
//! carrying the registered addresses verbatim, and the SOA and NS records
//! of the zone apex. [`RegistryRecordData`] is the enum over exactly that
//! set; [`Uri`] is the one type the `domain` crate does not ship.
//!
//! [RFC 7553]: https://tools.ietf.org/html/rfc7553

use core::cmp::Ordering;
use core::fmt;

use bytes::Bytes;
use domain::base::iana::Rtype;
use domain::base::name::{Name, ParsedName, ToName};
use domain::base::rdata::{ComposeRecordData, ParseRecordData, RecordData};
use domain::base::wire::{Compose, Composer, Parse, ParseError};
use domain::base::Record;
use domain::rdata::{Aaaa, Cname, Ns, Soa, A};
use octseq::octets::Octets;
use octseq::parse::Parser;

//------------ Type Aliases --------------------------------------------------

/// The octets type everything is stored in.
pub type StoredName = Name<Bytes>;
pub type StoredRecordData = RegistryRecordData<Bytes, StoredName>;
pub type StoredRecord = Record<StoredName, StoredRecordData>;

//------------ Uri -----------------------------------------------------------

/// URI record data.
///
/// The target is the URI itself as raw octets; unlike most text-ish
/// record data it is not length-prefixed but simply fills the remainder
/// of the record.
#[derive(Clone, Debug, Hash)]
pub struct Uri<Octs> {
    priority: u16,
    weight: u16,
    target: Octs,
}

impl Uri<()> {
    /// The rtype of this record data type.
    pub(crate) const RTYPE: Rtype = Rtype::URI;
}

impl<Octs> Uri<Octs> {
    pub fn new(priority: u16, weight: u16, target: Octs) -> Self {
        Uri {
            priority,
            weight,
            target,
        }
    }

    pub fn priority(&self) -> u16 {
        self.priority
    }

    pub fn weight(&self) -> u16 {
        self.weight
    }

    pub fn target(&self) -> &Octs {
        &self.target
    }

    pub fn into_target(self) -> Octs {
        self.target
    }

    pub fn parse<'a, Src: Octets<Range<'a> = Octs> + ?Sized + 'a>(
        parser: &mut Parser<'a, Src>,
    ) -> Result<Self, ParseError> {
        let priority = u16::parse(parser)?;
        let weight = u16::parse(parser)?;
        let len = parser.remaining();
        let target = parser.parse_octets(len)?;
        Ok(Uri::new(priority, weight, target))
    }
}

impl<Octs: AsRef<[u8]>> Uri<Octs> {
    /// The target as a string, if it is valid UTF-8.
    pub fn target_str(&self) -> Option<&str> {
        core::str::from_utf8(self.target.as_ref()).ok()
    }
}

//--- PartialEq, Eq, PartialOrd, Ord

impl<Octs, OtherOcts> PartialEq<Uri<OtherOcts>> for Uri<Octs>
where
    Octs: AsRef<[u8]>,
    OtherOcts: AsRef<[u8]>,
{
    fn eq(&self, other: &Uri<OtherOcts>) -> bool {
        self.priority == other.priority
            && self.weight == other.weight
            && self.target.as_ref() == other.target.as_ref()
    }
}

impl<Octs: AsRef<[u8]>> Eq for Uri<Octs> {}

impl<Octs, OtherOcts> PartialOrd<Uri<OtherOcts>> for Uri<Octs>
where
    Octs: AsRef<[u8]>,
    OtherOcts: AsRef<[u8]>,
{
    fn partial_cmp(&self, other: &Uri<OtherOcts>) -> Option<Ordering> {
        match self.priority.partial_cmp(&other.priority) {
            Some(Ordering::Equal) => {}
            other => return other,
        }
        match self.weight.partial_cmp(&other.weight) {
            Some(Ordering::Equal) => {}
            other => return other,
        }
        self.target.as_ref().partial_cmp(other.target.as_ref())
    }
}

impl<Octs: AsRef<[u8]>> Ord for Uri<Octs> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.partial_cmp(other).expect("total order")
    }
}

//--- RecordData, ParseRecordData, ComposeRecordData

impl<Octs> RecordData for Uri<Octs> {
    fn rtype(&self) -> Rtype {
        Uri::RTYPE
    }
}

impl<'a, Octs: Octets + ?Sized> ParseRecordData<'a, Octs>
    for Uri<Octs::Range<'a>>
{
    fn parse_rdata(
        rtype: Rtype,
        parser: &mut Parser<'a, Octs>,
    ) -> Result<Option<Self>, ParseError> {
        if rtype == Uri::RTYPE {
            Self::parse(parser).map(Some)
        } else {
            Ok(None)
        }
    }
}

impl<Octs: AsRef<[u8]>> ComposeRecordData for Uri<Octs> {
    fn rdlen(&self, _compress: bool) -> Option<u16> {
        Some(
            u16::try_from(self.target.as_ref().len())
                .expect("URI target too long")
                + 4,
        )
    }

    fn compose_rdata<Target: Composer + ?Sized>(
        &self,
        target: &mut Target,
    ) -> Result<(), Target::AppendError> {
        self.priority.compose(target)?;
        self.weight.compose(target)?;
        target.append_slice(self.target.as_ref())
    }

    fn compose_canonical_rdata<Target: Composer + ?Sized>(
        &self,
        target: &mut Target,
    ) -> Result<(), Target::AppendError> {
        self.compose_rdata(target)
    }
}

//--- Display

impl<Octs: AsRef<[u8]>> fmt::Display for Uri<Octs> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {} \"{}\"",
            self.priority,
            self.weight,
            String::from_utf8_lossy(self.target.as_ref())
        )
    }
}

//------------ RegistryRecordData --------------------------------------------

/// The record data of any record the registry stores or serves.
#[derive(Clone, Debug)]
pub enum RegistryRecordData<Octs, NameT> {
    A(A),
    Aaaa(Aaaa),
    Cname(Cname<NameT>),
    Ns(Ns<NameT>),
    Soa(Soa<NameT>),
    Uri(Uri<Octs>),
}

impl<Octs, NameT> RegistryRecordData<Octs, NameT> {
    pub fn rtype(&self) -> Rtype {
        match self {
            RegistryRecordData::A(_) => Rtype::A,
            RegistryRecordData::Aaaa(_) => Rtype::AAAA,
            RegistryRecordData::Cname(_) => Rtype::CNAME,
            RegistryRecordData::Ns(_) => Rtype::NS,
            RegistryRecordData::Soa(_) => Rtype::SOA,
            RegistryRecordData::Uri(_) => Uri::RTYPE,
        }
    }
}

impl<Octs, NameT> RegistryRecordData<Octs, NameT>
where
    Octs: AsRef<[u8]>,
    NameT: ToName,
{
    /// Copies the data into the stored octets and name types.
    pub fn to_stored(&self) -> Result<StoredRecordData, ParseError> {
        fn name<N: ToName>(n: &N) -> Result<StoredName, ParseError> {
            n.try_to_name::<Bytes>().map_err(|_| ParseError::ShortInput)
        }

        Ok(match self {
            RegistryRecordData::A(a) => RegistryRecordData::A(a.clone()),
            RegistryRecordData::Aaaa(aaaa) => RegistryRecordData::Aaaa(aaaa.clone()),
            RegistryRecordData::Cname(cname) => {
                RegistryRecordData::Cname(Cname::new(name(cname.cname())?))
            }
            RegistryRecordData::Ns(ns) => {
                RegistryRecordData::Ns(Ns::new(name(ns.nsdname())?))
            }
            RegistryRecordData::Soa(soa) => {
                RegistryRecordData::Soa(Soa::new(
                    name(soa.mname())?,
                    name(soa.rname())?,
                    soa.serial(),
                    soa.refresh(),
                    soa.retry(),
                    soa.expire(),
                    soa.minimum(),
                ))
            }
            RegistryRecordData::Uri(uri) => RegistryRecordData::Uri(Uri::new(
                uri.priority(),
                uri.weight(),
                Bytes::copy_from_slice(uri.target().as_ref()),
            )),
        })
    }
}

//--- From

impl<Octs, NameT> From<A> for RegistryRecordData<Octs, NameT> {
    fn from(a: A) -> Self {
        RegistryRecordData::A(a)
    }
}

impl<Octs, NameT> From<Aaaa> for RegistryRecordData<Octs, NameT> {
    fn from(aaaa: Aaaa) -> Self {
        RegistryRecordData::Aaaa(aaaa)
    }
}

impl<Octs, NameT> From<Cname<NameT>> for RegistryRecordData<Octs, NameT> {
    fn from(cname: Cname<NameT>) -> Self {
        RegistryRecordData::Cname(cname)
    }
}

impl<Octs, NameT> From<Ns<NameT>> for RegistryRecordData<Octs, NameT> {
    fn from(ns: Ns<NameT>) -> Self {
        RegistryRecordData::Ns(ns)
    }
}

impl<Octs, NameT> From<Soa<NameT>> for RegistryRecordData<Octs, NameT> {
    fn from(soa: Soa<NameT>) -> Self {
        RegistryRecordData::Soa(soa)
    }
}

impl<Octs, NameT> From<Uri<Octs>> for RegistryRecordData<Octs, NameT> {
    fn from(uri: Uri<Octs>) -> Self {
        RegistryRecordData::Uri(uri)
    }
}

//--- PartialEq and Eq

impl<O, OO, N, NN> PartialEq<RegistryRecordData<OO, NN>>
    for RegistryRecordData<O, N>
where
    O: AsRef<[u8]>,
    OO: AsRef<[u8]>,
    N: ToName,
    NN: ToName,
{
    fn eq(&self, other: &RegistryRecordData<OO, NN>) -> bool {
        match (self, other) {
            (RegistryRecordData::A(left), RegistryRecordData::A(right)) => {
                left == right
            }
            (
                RegistryRecordData::Aaaa(left),
                RegistryRecordData::Aaaa(right),
            ) => left == right,
            (
                RegistryRecordData::Cname(left),
                RegistryRecordData::Cname(right),
            ) => left == right,
            (RegistryRecordData::Ns(left), RegistryRecordData::Ns(right)) => {
                left == right
            }
            (
                RegistryRecordData::Soa(left),
                RegistryRecordData::Soa(right),
            ) => left == right,
            (
                RegistryRecordData::Uri(left),
                RegistryRecordData::Uri(right),
            ) => left == right,
            _ => false,
        }
    }
}

impl<O: AsRef<[u8]>, N: ToName> Eq for RegistryRecordData<O, N> {}

//--- RecordData, ParseRecordData, ComposeRecordData

impl<Octs, NameT> RecordData for RegistryRecordData<Octs, NameT> {
    fn rtype(&self) -> Rtype {
        RegistryRecordData::rtype(self)
    }
}

impl<'a, Octs: Octets + ?Sized> ParseRecordData<'a, Octs>
    for RegistryRecordData<Octs::Range<'a>, ParsedName<Octs::Range<'a>>>
{
    fn parse_rdata(
        rtype: Rtype,
        parser: &mut Parser<'a, Octs>,
    ) -> Result<Option<Self>, ParseError> {
        match rtype {
            Rtype::A => {
                A::parse(parser).map(RegistryRecordData::A).map(Some)
            }
            Rtype::AAAA => {
                Aaaa::parse(parser).map(RegistryRecordData::Aaaa).map(Some)
            }
            Rtype::CNAME => Cname::parse(parser)
                .map(RegistryRecordData::Cname)
                .map(Some),
            Rtype::NS => {
                Ns::parse(parser).map(RegistryRecordData::Ns).map(Some)
            }
            Rtype::SOA => {
                Soa::parse(parser).map(RegistryRecordData::Soa).map(Some)
            }
            Rtype::URI => {
                Uri::parse(parser).map(RegistryRecordData::Uri).map(Some)
            }
            _ => Ok(None),
        }
    }
}

impl<Octs, NameT> ComposeRecordData for RegistryRecordData<Octs, NameT>
where
    Octs: AsRef<[u8]>,
    NameT: ToName,
{
    fn rdlen(&self, compress: bool) -> Option<u16> {
        match self {
            RegistryRecordData::A(inner) => inner.rdlen(compress),
            RegistryRecordData::Aaaa(inner) => inner.rdlen(compress),
            RegistryRecordData::Cname(inner) => inner.rdlen(compress),
            RegistryRecordData::Ns(inner) => inner.rdlen(compress),
            RegistryRecordData::Soa(inner) => inner.rdlen(compress),
            RegistryRecordData::Uri(inner) => inner.rdlen(compress),
        }
    }

    fn compose_rdata<Target: Composer + ?Sized>(
        &self,
        target: &mut Target,
    ) -> Result<(), Target::AppendError> {
        match self {
            RegistryRecordData::A(inner) => inner.compose_rdata(target),
            RegistryRecordData::Aaaa(inner) => inner.compose_rdata(target),
            RegistryRecordData::Cname(inner) => inner.compose_rdata(target),
            RegistryRecordData::Ns(inner) => inner.compose_rdata(target),
            RegistryRecordData::Soa(inner) => inner.compose_rdata(target),
            RegistryRecordData::Uri(inner) => inner.compose_rdata(target),
        }
    }

    fn compose_canonical_rdata<Target: Composer + ?Sized>(
        &self,
        target: &mut Target,
    ) -> Result<(), Target::AppendError> {
        match self {
            RegistryRecordData::A(inner) => {
                inner.compose_canonical_rdata(target)
            }
            RegistryRecordData::Aaaa(inner) => {
                inner.compose_canonical_rdata(target)
            }
            RegistryRecordData::Cname(inner) => {
                inner.compose_canonical_rdata(target)
            }
            RegistryRecordData::Ns(inner) => {
                inner.compose_canonical_rdata(target)
            }
            RegistryRecordData::Soa(inner) => {
                inner.compose_canonical_rdata(target)
            }
            RegistryRecordData::Uri(inner) => {
                inner.compose_canonical_rdata(target)
            }
        }
    }
}

//--- Display

impl<Octs, NameT> fmt::Display for RegistryRecordData<Octs, NameT>
where
    Octs: AsRef<[u8]>,
    NameT: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RegistryRecordData::A(inner) => inner.fmt(f),
            RegistryRecordData::Aaaa(inner) => inner.fmt(f),
            RegistryRecordData::Cname(inner) => inner.fmt(f),
            RegistryRecordData::Ns(inner) => inner.fmt(f),
            RegistryRecordData::Soa(inner) => inner.fmt(f),
            RegistryRecordData::Uri(inner) => inner.fmt(f),
        }
    }
}

//============ Testing =======================================================

#[cfg(test)]
mod tests {
    use super::*;
    use domain::base::iana::{Class, Rcode};
    use domain::base::{MessageBuilder, Ttl};
    use std::str::FromStr;

    #[test]
    fn uri_round_trips_through_a_message() {
        let name = StoredName::from_str("_agora._tcp.example").unwrap();
        let uri = Uri::new(1, 1, Bytes::from_static(b"agora://1.2.3.4:2826"));

        let mut builder = MessageBuilder::new_vec()
            .start_answer(
                &MessageBuilder::new_vec().into_message(),
                Rcode::NOERROR,
            )
            .unwrap();
        builder
            .push((&name, Class::IN, Ttl::from_secs(600), uri.clone()))
            .unwrap();
        let msg = builder.into_message();

        let record = msg
            .answer()
            .unwrap()
            .limit_to::<Uri<_>>()
            .next()
            .unwrap()
            .unwrap();
        assert_eq!(record.data().priority(), 1);
        assert_eq!(
            record.data().target_str().unwrap(),
            "agora://1.2.3.4:2826"
        );
    }

    #[test]
    fn enum_parses_each_served_type() {
        let name = StoredName::from_str("k.validators.realm").unwrap();
        let records: Vec<StoredRecordData> = vec![
            A::new("1.2.3.4".parse().unwrap()).into(),
            Aaaa::new("2001:db8::1".parse().unwrap()).into(),
            Cname::new(StoredName::from_str("host.example").unwrap()).into(),
            Uri::new(1, 1, Bytes::from_static(b"agora://h.example:2826"))
                .into(),
        ];

        let mut builder = MessageBuilder::new_vec()
            .start_answer(
                &MessageBuilder::new_vec().into_message(),
                Rcode::NOERROR,
            )
            .unwrap();
        for data in &records {
            builder
                .push((&name, Class::IN, Ttl::from_secs(60), data.clone()))
                .unwrap();
        }
        let msg = builder.into_message();

        let reparsed: Vec<StoredRecordData> = msg
            .answer()
            .unwrap()
            .limit_to::<RegistryRecordData<_, _>>()
            .map(|record| record.unwrap().data().to_stored().unwrap())
            .collect();
        assert_eq!(reparsed, records);
    }
}
